//! Invite code issuance and redemption.
//!
//! Codes are single-use, time-boxed tokens stored inside the issuer's user
//! document. Redemption is the code-based path into the pairing transition:
//! the used-code mark and the symmetric `partner_id` assignment commit in
//! one atomic batch, so a code can pair at most one couple.

use chrono::Utc;
use duet_core::UserId;
use duet_store::{link_partners, InviteCode, Store, UserRecord};
use rand::Rng;
use tracing::info;

use crate::error::{PairingError, Result};
use crate::types::{PairOutcome, PairingConfig};

/// Alphabet for generated codes. Uppercase-only so that normalization at
/// redemption (trim + uppercase) cannot miss a match.
const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a generated code.
const CODE_LEN: usize = 6;

/// Produce a random 6-character code.
fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

/// Normalize a user-supplied code for lookup.
fn normalize(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Generate a fresh invite code for a user.
///
/// Expired and already-used entries in the user's inventory are dropped in
/// the same write (lazy garbage collection); codes are never actively
/// deleted elsewhere.
///
/// # Errors
///
/// Returns `NotLoggedIn` if the caller has no user document, or
/// `AlreadyPartnered` if the caller already has a partner.
pub fn generate<S: Store>(
    store: &S,
    config: &PairingConfig,
    user_id: &UserId,
) -> Result<InviteCode> {
    let mut user = store.get_user(user_id)?.ok_or(PairingError::NotLoggedIn)?;
    if user.is_partnered() {
        return Err(PairingError::AlreadyPartnered(*user_id));
    }

    let now = Utc::now();
    let code = InviteCode {
        code: random_code(),
        created_by: *user_id,
        created_at: now,
        expires_at: now + config.code_ttl(),
        used: false,
        used_by: None,
        used_at: None,
    };

    user.invite_codes
        .retain(|c| c.is_redeemable(now, config.code_grace()));
    user.invite_codes.push(code.clone());
    user.updated_at = now;
    store.put_user(&user)?;

    info!(user_id = %user_id, code = %code.code, expires_at = %code.expires_at, "Generated invite code");

    Ok(code)
}

/// The caller's currently redeemable code, if any.
///
/// # Errors
///
/// Returns `NotLoggedIn` if the caller has no user document.
pub fn active_code<S: Store>(
    store: &S,
    config: &PairingConfig,
    user_id: &UserId,
) -> Result<Option<InviteCode>> {
    let user = store.get_user(user_id)?.ok_or(PairingError::NotLoggedIn)?;
    let now = Utc::now();
    Ok(user
        .invite_codes
        .iter()
        .rev()
        .find(|c| c.is_redeemable(now, config.code_grace()))
        .cloned())
}

/// Redeem an invite code, committing the pairing transition.
///
/// The code is normalized (trim + uppercase), then located by scanning all
/// user documents' code inventories — codes are not globally indexed, so
/// this is O(total users) per redemption. Expiry checks apply the
/// configured grace buffer. On success the used-code mark and both sides'
/// `partner_id` assignment commit in one atomic batch.
///
/// # Errors
///
/// Returns `NotLoggedIn` or `AlreadyPartnered` for the redeemer,
/// `InvalidOrExpiredCode` when no redeemable match exists (including a code
/// whose issuer has since paired elsewhere), and `SelfPairing` when the
/// redeemer issued the code.
pub fn redeem<S: Store>(
    store: &S,
    config: &PairingConfig,
    raw_code: &str,
    redeemer_id: &UserId,
) -> Result<PairOutcome> {
    let code = normalize(raw_code);

    let mut redeemer = store
        .get_user(redeemer_id)?
        .ok_or(PairingError::NotLoggedIn)?;
    if redeemer.is_partnered() {
        return Err(PairingError::AlreadyPartnered(*redeemer_id));
    }

    let now = Utc::now();
    let grace = config.code_grace();

    let mut issuer: Option<UserRecord> = None;
    for user in store.list_all_users()? {
        if user
            .invite_codes
            .iter()
            .any(|c| c.code == code && c.is_redeemable(now, grace))
        {
            issuer = Some(user);
            break;
        }
    }
    let mut issuer = issuer.ok_or(PairingError::InvalidOrExpiredCode)?;

    if issuer.user_id == *redeemer_id {
        return Err(PairingError::SelfPairing);
    }
    if issuer.is_partnered() {
        // Stale inventory: the issuer paired through another path after
        // generating this code.
        return Err(PairingError::InvalidOrExpiredCode);
    }

    for entry in &mut issuer.invite_codes {
        if entry.code == code && !entry.used {
            entry.used = true;
            entry.used_by = Some(*redeemer_id);
            entry.used_at = Some(now);
        }
    }

    link_partners(&mut issuer, &mut redeemer, now);
    store.put_user_pair(&issuer, &redeemer)?;

    info!(
        code = %code,
        issuer = %issuer.user_id,
        redeemer = %redeemer_id,
        "Redeemed invite code, partnership committed"
    );

    Ok(PairOutcome {
        user: redeemer,
        partner: issuer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use duet_store::RocksStore;
    use tempfile::TempDir;

    fn setup() -> (RocksStore, TempDir, PairingConfig) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir, PairingConfig::default())
    }

    fn create_user(store: &RocksStore, name: &str) -> UserRecord {
        let user_id = UserId::generate_deterministic(&format!("{name}@example.com"), name, 7);
        let user = UserRecord::new(user_id, name, format!("{name}@example.com"));
        store.put_user(&user).unwrap();
        user
    }

    #[test]
    fn generated_code_shape() {
        let code = random_code();
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| CODE_CHARSET.contains(&b)));
    }

    #[test]
    fn generate_returns_active_code() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "alice");

        let code = generate(&store, &config, &alice.user_id).unwrap();
        assert_eq!(code.created_by, alice.user_id);
        assert!(!code.used);

        let active = active_code(&store, &config, &alice.user_id)
            .unwrap()
            .unwrap();
        assert_eq!(active.code, code.code);
    }

    #[test]
    fn generate_fails_when_partnered() {
        let (store, _dir, config) = setup();
        let mut alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        alice.partner_id = Some(bob.user_id);
        store.put_user(&alice).unwrap();

        let result = generate(&store, &config, &alice.user_id);
        assert!(matches!(result, Err(PairingError::AlreadyPartnered(_))));
    }

    #[test]
    fn generate_drops_expired_and_used_entries() {
        let (store, _dir, config) = setup();
        let mut alice = create_user(&store, "alice");
        let now = Utc::now();

        alice.invite_codes.push(InviteCode {
            code: "OLDOLD".to_string(),
            created_by: alice.user_id,
            created_at: now - Duration::minutes(30),
            expires_at: now - Duration::minutes(20),
            used: false,
            used_by: None,
            used_at: None,
        });
        alice.invite_codes.push(InviteCode {
            code: "USEDUP".to_string(),
            created_by: alice.user_id,
            created_at: now,
            expires_at: now + Duration::minutes(10),
            used: true,
            used_by: None,
            used_at: None,
        });
        store.put_user(&alice).unwrap();

        let fresh = generate(&store, &config, &alice.user_id).unwrap();

        let stored = store.get_user(&alice.user_id).unwrap().unwrap();
        assert_eq!(stored.invite_codes.len(), 1);
        assert_eq!(stored.invite_codes[0].code, fresh.code);
    }

    #[test]
    fn redeem_pairs_both_sides() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        let code = generate(&store, &config, &alice.user_id).unwrap();
        let outcome = redeem(&store, &config, &code.code, &bob.user_id).unwrap();

        assert_eq!(outcome.partner.user_id, alice.user_id);

        let stored_alice = store.get_user(&alice.user_id).unwrap().unwrap();
        let stored_bob = store.get_user(&bob.user_id).unwrap().unwrap();
        assert_eq!(stored_alice.partner_id, Some(bob.user_id));
        assert_eq!(stored_bob.partner_id, Some(alice.user_id));

        // Code marked used by bob in the same commit
        let entry = &stored_alice.invite_codes[0];
        assert!(entry.used);
        assert_eq!(entry.used_by, Some(bob.user_id));
        assert!(entry.used_at.is_some());
    }

    #[test]
    fn redeem_normalizes_input() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        let code = generate(&store, &config, &alice.user_id).unwrap();
        let sloppy = format!("  {}  ", code.code.to_lowercase());

        assert!(redeem(&store, &config, &sloppy, &bob.user_id).is_ok());
    }

    #[test]
    fn second_redemption_fails() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        let carol = create_user(&store, "carol");

        let code = generate(&store, &config, &alice.user_id).unwrap();
        redeem(&store, &config, &code.code, &bob.user_id).unwrap();

        let result = redeem(&store, &config, &code.code, &carol.user_id);
        assert!(matches!(result, Err(PairingError::InvalidOrExpiredCode)));
    }

    #[test]
    fn expired_code_rejected_beyond_grace() {
        let (store, _dir, config) = setup();
        let mut alice = create_user(&store, "alice");
        let carol = create_user(&store, "carol");
        let now = Utc::now();

        alice.invite_codes.push(InviteCode {
            code: "AB12CD".to_string(),
            created_by: alice.user_id,
            created_at: now - Duration::minutes(11),
            expires_at: now - Duration::minutes(1) - Duration::seconds(1),
            used: false,
            used_by: None,
            used_at: None,
        });
        store.put_user(&alice).unwrap();

        let result = redeem(&store, &config, "AB12CD", &carol.user_id);
        assert!(matches!(result, Err(PairingError::InvalidOrExpiredCode)));
    }

    #[test]
    fn expired_code_accepted_within_grace() {
        let (store, _dir, config) = setup();
        let mut alice = create_user(&store, "alice");
        let carol = create_user(&store, "carol");
        let now = Utc::now();

        // 30 seconds past expiry: inside the 1-minute grace buffer
        alice.invite_codes.push(InviteCode {
            code: "AB12CD".to_string(),
            created_by: alice.user_id,
            created_at: now - Duration::minutes(10),
            expires_at: now - Duration::seconds(30),
            used: false,
            used_by: None,
            used_at: None,
        });
        store.put_user(&alice).unwrap();

        assert!(redeem(&store, &config, "AB12CD", &carol.user_id).is_ok());
    }

    #[test]
    fn self_redemption_rejected() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "alice");

        let code = generate(&store, &config, &alice.user_id).unwrap();
        let result = redeem(&store, &config, &code.code, &alice.user_id);
        assert!(matches!(result, Err(PairingError::SelfPairing)));
    }

    #[test]
    fn unknown_code_rejected() {
        let (store, _dir, config) = setup();
        let bob = create_user(&store, "bob");

        let result = redeem(&store, &config, "NOPE12", &bob.user_id);
        assert!(matches!(result, Err(PairingError::InvalidOrExpiredCode)));
    }

    #[test]
    fn partnered_redeemer_rejected() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let mut bob = create_user(&store, "bob");
        let carol = create_user(&store, "carol");

        let code = generate(&store, &config, &alice.user_id).unwrap();

        bob.partner_id = Some(carol.user_id);
        store.put_user(&bob).unwrap();

        let result = redeem(&store, &config, &code.code, &bob.user_id);
        assert!(matches!(result, Err(PairingError::AlreadyPartnered(_))));
    }

    #[test]
    fn code_of_partnered_issuer_is_dead() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        let carol = create_user(&store, "carol");

        let code = generate(&store, &config, &alice.user_id).unwrap();

        // Alice pairs with bob through another path; her old code must not
        // pull carol into the partnership.
        let mut stored_alice = store.get_user(&alice.user_id).unwrap().unwrap();
        let mut stored_bob = store.get_user(&bob.user_id).unwrap().unwrap();
        link_partners(&mut stored_alice, &mut stored_bob, Utc::now());
        store.put_user_pair(&stored_alice, &stored_bob).unwrap();

        let result = redeem(&store, &config, &code.code, &carol.user_id);
        assert!(matches!(result, Err(PairingError::InvalidOrExpiredCode)));
    }
}
