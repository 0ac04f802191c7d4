//! Partner request operations: search, send, accept, decline.
//!
//! The request path is the targeted alternative to invite codes. Accepting
//! a request converges on the same pairing transition as redemption: the
//! request's terminal status, the recipient's pending-list removal, and the
//! symmetric `partner_id` assignment commit in one atomic batch.

use chrono::Utc;
use duet_core::{RequestId, UserId};
use duet_store::{link_partners, PartnerRequest, RequestStatus, Store};
use tracing::{debug, info};

use crate::error::{PairingError, Result};
use crate::types::{PairOutcome, PairingConfig, UserSummary};

/// Search unpartnered users by display name or email.
///
/// Case-insensitive substring match, excluding the searcher; the result
/// set is bounded by `config.search_limit`.
///
/// # Errors
///
/// Returns `TermTooShort` when the trimmed term is shorter than
/// `config.min_search_chars`.
pub fn search<S: Store>(
    store: &S,
    config: &PairingConfig,
    term: &str,
    excluding: &UserId,
) -> Result<Vec<UserSummary>> {
    let term = term.trim();
    if term.chars().count() < config.min_search_chars {
        return Err(PairingError::TermTooShort {
            min: config.min_search_chars,
        });
    }

    let needle = term.to_lowercase();
    let mut matches = Vec::new();
    for user in store.list_all_users()? {
        if user.user_id == *excluding || user.is_partnered() {
            continue;
        }
        if user.display_name.to_lowercase().contains(&needle)
            || user.email.to_lowercase().contains(&needle)
        {
            matches.push(UserSummary::from(&user));
            if matches.len() >= config.search_limit {
                break;
            }
        }
    }

    Ok(matches)
}

/// Send a partner request to another user.
///
/// The request record and the recipient's pending-list append commit in
/// one atomic batch.
///
/// # Errors
///
/// Returns `NotLoggedIn` for a missing sender, `UserNotFound` for a
/// missing recipient, `SelfPairing` for a self-targeted request, and
/// `AlreadyPartnered` when either side already has a partner.
pub fn send<S: Store>(
    store: &S,
    config: &PairingConfig,
    sender_id: &UserId,
    recipient_id: &UserId,
) -> Result<PartnerRequest> {
    if sender_id == recipient_id {
        return Err(PairingError::SelfPairing);
    }

    let sender = store.get_user(sender_id)?.ok_or(PairingError::NotLoggedIn)?;
    if sender.is_partnered() {
        return Err(PairingError::AlreadyPartnered(*sender_id));
    }

    let mut recipient = store
        .get_user(recipient_id)?
        .ok_or(PairingError::UserNotFound(*recipient_id))?;
    if recipient.is_partnered() {
        return Err(PairingError::AlreadyPartnered(*recipient_id));
    }

    let now = Utc::now();
    let request = PartnerRequest {
        request_id: RequestId::generate(),
        sender_id: *sender_id,
        sender_name: sender.display_name.clone(),
        recipient_id: *recipient_id,
        status: RequestStatus::Pending,
        created_at: now,
        expires_at: now + config.request_ttl(),
    };

    recipient.pending_requests.push(request.request_id);
    recipient.updated_at = now;
    store.put_request_with_user(&request, &recipient)?;

    info!(
        request_id = %request.request_id,
        sender = %sender_id,
        recipient = %recipient_id,
        "Sent partner request"
    );

    Ok(request)
}

/// Accept a partner request, committing the pairing transition.
///
/// # Errors
///
/// Returns `RequestNotFound`, `NotAuthorized` (caller is not the
/// recipient), `RequestNoLongerPending`, `RequestExpired`,
/// `NotLoggedIn` for a missing caller record, `UserNotFound` for a
/// vanished sender, or `AlreadyPartnered` when either party gained a
/// partner since the request was sent.
pub fn accept<S: Store>(
    store: &S,
    request_id: &RequestId,
    accepting_user: &UserId,
) -> Result<PairOutcome> {
    let mut request = store
        .get_request(request_id)?
        .ok_or(PairingError::RequestNotFound(*request_id))?;

    if request.recipient_id != *accepting_user {
        return Err(PairingError::NotAuthorized);
    }
    if request.status != RequestStatus::Pending {
        return Err(PairingError::RequestNoLongerPending(*request_id));
    }

    let now = Utc::now();
    if request.is_expired(now) {
        return Err(PairingError::RequestExpired(*request_id));
    }

    let mut recipient = store
        .get_user(accepting_user)?
        .ok_or(PairingError::NotLoggedIn)?;
    let mut sender = store
        .get_user(&request.sender_id)?
        .ok_or(PairingError::UserNotFound(request.sender_id))?;

    if recipient.is_partnered() {
        return Err(PairingError::AlreadyPartnered(*accepting_user));
    }
    if sender.is_partnered() {
        return Err(PairingError::AlreadyPartnered(request.sender_id));
    }

    request.status = RequestStatus::Accepted;
    recipient.pending_requests.retain(|id| id != request_id);
    link_partners(&mut recipient, &mut sender, now);
    store.put_pairing(&recipient, &sender, Some(&request))?;

    info!(
        request_id = %request_id,
        sender = %sender.user_id,
        recipient = %accepting_user,
        "Accepted partner request, partnership committed"
    );

    Ok(PairOutcome {
        user: recipient,
        partner: sender,
    })
}

/// Decline a partner request.
///
/// Idempotent: a missing request, or one already in a terminal state, is a
/// no-op — declining twice neither errors nor resurrects the request.
///
/// # Errors
///
/// Returns `NotAuthorized` if the caller is not the recipient.
pub fn decline<S: Store>(store: &S, request_id: &RequestId, declining_user: &UserId) -> Result<()> {
    let Some(mut request) = store.get_request(request_id)? else {
        debug!(request_id = %request_id, "Declined missing request, no-op");
        return Ok(());
    };

    if request.recipient_id != *declining_user {
        return Err(PairingError::NotAuthorized);
    }
    if request.status != RequestStatus::Pending {
        debug!(request_id = %request_id, status = ?request.status, "Request already terminal, no-op");
        return Ok(());
    }

    request.status = RequestStatus::Declined;

    if let Some(mut recipient) = store.get_user(declining_user)? {
        recipient.pending_requests.retain(|id| id != request_id);
        recipient.updated_at = Utc::now();
        store.put_request_with_user(&request, &recipient)?;
    } else {
        store.put_request(&request)?;
    }

    info!(request_id = %request_id, recipient = %declining_user, "Declined partner request");

    Ok(())
}

/// The caller's currently valid incoming requests.
///
/// Resolves each id in the caller's pending list and filters to requests
/// that are still `Pending` and unexpired. Expired-but-pending records are
/// filtered here, never physically purged.
///
/// # Errors
///
/// Returns `NotLoggedIn` if the caller has no user document.
pub fn pending<S: Store>(store: &S, user_id: &UserId) -> Result<Vec<PartnerRequest>> {
    let user = store.get_user(user_id)?.ok_or(PairingError::NotLoggedIn)?;
    let now = Utc::now();

    let mut valid = Vec::new();
    for request_id in &user.pending_requests {
        if let Some(request) = store.get_request(request_id)? {
            if request.status == RequestStatus::Pending && !request.is_expired(now) {
                valid.push(request);
            }
        }
    }

    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use duet_store::{RocksStore, UserRecord};
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
    fn search_matches_name_and_email() {
        let (store, _dir, config) = setup();
        create_user(&store, "Alice");
        create_user(&store, "Bob");
        create_user(&store, "Alicia");

        let searcher = create_user(&store, "Searcher");

        let by_name = search(&store, &config, "ali", &searcher.user_id).unwrap();
        assert_eq!(by_name.len(), 2);

        let by_email = search(&store, &config, "BOB@EXAMPLE", &searcher.user_id).unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].display_name, "Bob");
    }

    #[test]
    fn search_excludes_the_searcher() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        create_user(&store, "Alicia");

        let results = search(&store, &config, "ali", &alice.user_id).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.iter().all(|u| u.user_id != alice.user_id));
    }

    #[test]
    fn search_excludes_partnered_users() {
        let (store, _dir, config) = setup();
        let mut alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");
        let searcher = create_user(&store, "Searcher");

        alice.partner_id = Some(bob.user_id);
        store.put_user(&alice).unwrap();

        let results = search(&store, &config, "alice", &searcher.user_id).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn search_term_too_short() {
        let (store, _dir, config) = setup();
        let searcher = create_user(&store, "Searcher");

        let result = search(&store, &config, " a ", &searcher.user_id);
        assert!(matches!(result, Err(PairingError::TermTooShort { min: 2 })));
    }

    #[test]
    fn send_appends_to_recipient_pending_list() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");

        let request = send(&store, &config, &alice.user_id, &bob.user_id).unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.sender_name, "Alice");

        let stored_bob = store.get_user(&bob.user_id).unwrap().unwrap();
        assert_eq!(stored_bob.pending_requests, vec![request.request_id]);
    }

    #[test]
    fn send_to_self_rejected() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");

        let result = send(&store, &config, &alice.user_id, &alice.user_id);
        assert!(matches!(result, Err(PairingError::SelfPairing)));
    }

    #[test]
    fn send_to_partnered_recipient_rejected() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let mut bob = create_user(&store, "Bob");
        let carol = create_user(&store, "Carol");

        bob.partner_id = Some(carol.user_id);
        store.put_user(&bob).unwrap();

        let result = send(&store, &config, &alice.user_id, &bob.user_id);
        assert!(matches!(result, Err(PairingError::AlreadyPartnered(_))));
    }

    #[test]
    fn accept_pairs_and_clears_pending_list() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");

        let request = send(&store, &config, &alice.user_id, &bob.user_id).unwrap();
        let outcome = accept(&store, &request.request_id, &bob.user_id).unwrap();

        assert_eq!(outcome.partner.user_id, alice.user_id);

        let stored_alice = store.get_user(&alice.user_id).unwrap().unwrap();
        let stored_bob = store.get_user(&bob.user_id).unwrap().unwrap();
        assert_eq!(stored_alice.partner_id, Some(bob.user_id));
        assert_eq!(stored_bob.partner_id, Some(alice.user_id));
        assert!(stored_bob.pending_requests.is_empty());

        let stored_request = store.get_request(&request.request_id).unwrap().unwrap();
        assert_eq!(stored_request.status, RequestStatus::Accepted);
    }

    #[test]
    fn accept_requires_recipient() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");
        let carol = create_user(&store, "Carol");

        let request = send(&store, &config, &alice.user_id, &bob.user_id).unwrap();
        let result = accept(&store, &request.request_id, &carol.user_id);
        assert!(matches!(result, Err(PairingError::NotAuthorized)));
    }

    #[test]
    fn accept_missing_request() {
        let (store, _dir, _config) = setup();
        let bob = create_user(&store, "Bob");

        let result = accept(&store, &RequestId::generate(), &bob.user_id);
        assert!(matches!(result, Err(PairingError::RequestNotFound(_))));
    }

    #[test]
    fn accept_declined_request_no_longer_pending() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");

        let request = send(&store, &config, &alice.user_id, &bob.user_id).unwrap();
        decline(&store, &request.request_id, &bob.user_id).unwrap();

        let result = accept(&store, &request.request_id, &bob.user_id);
        assert!(matches!(
            result,
            Err(PairingError::RequestNoLongerPending(_))
        ));
    }

    #[test]
    fn accept_expired_request_rejected() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");

        let mut request = send(&store, &config, &alice.user_id, &bob.user_id).unwrap();
        request.expires_at = Utc::now() - Duration::seconds(1);
        store.put_request(&request).unwrap();

        let result = accept(&store, &request.request_id, &bob.user_id);
        assert!(matches!(result, Err(PairingError::RequestExpired(_))));
    }

    #[test]
    fn accept_fails_if_sender_paired_meanwhile() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");
        let carol = create_user(&store, "Carol");

        let request = send(&store, &config, &alice.user_id, &bob.user_id).unwrap();

        // Alice pairs with carol before bob answers
        let mut stored_alice = store.get_user(&alice.user_id).unwrap().unwrap();
        let mut stored_carol = store.get_user(&carol.user_id).unwrap().unwrap();
        link_partners(&mut stored_alice, &mut stored_carol, Utc::now());
        store.put_user_pair(&stored_alice, &stored_carol).unwrap();

        let result = accept(&store, &request.request_id, &bob.user_id);
        assert!(matches!(result, Err(PairingError::AlreadyPartnered(_))));
    }

    #[test]
    fn decline_is_idempotent() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");

        let request = send(&store, &config, &alice.user_id, &bob.user_id).unwrap();

        decline(&store, &request.request_id, &bob.user_id).unwrap();
        // Second decline: no error, no resurrection
        decline(&store, &request.request_id, &bob.user_id).unwrap();

        let stored = store.get_request(&request.request_id).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Declined);
        assert!(pending(&store, &bob.user_id).unwrap().is_empty());
    }

    #[test]
    fn decline_missing_request_is_noop() {
        let (store, _dir, _config) = setup();
        let bob = create_user(&store, "Bob");

        assert!(decline(&store, &RequestId::generate(), &bob.user_id).is_ok());
    }

    #[test]
    fn pending_filters_expired_and_terminal() {
        let (store, _dir, config) = setup();
        let alice = create_user(&store, "Alice");
        let bob = create_user(&store, "Bob");
        let carol = create_user(&store, "Carol");

        // Valid request from alice
        let valid = send(&store, &config, &alice.user_id, &bob.user_id).unwrap();

        // Expired request from carol
        let mut expired = send(&store, &config, &carol.user_id, &bob.user_id).unwrap();
        expired.expires_at = Utc::now() - Duration::seconds(1);
        store.put_request(&expired).unwrap();

        let visible = pending(&store, &bob.user_id).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].request_id, valid.request_id);
    }
}
