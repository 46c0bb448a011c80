// Source-level security contracts. Cheap tripwires against refactors
// that would silently weaken the auth flow.

const STATE_SOURCE: &str = include_str!("../src/auth/state.rs");
const CIPHER_SOURCE: &str = include_str!("../src/auth/cipher.rs");
const CALLBACK_SOURCE: &str = include_str!("../src/api/callback.rs");
const PAGES_SOURCE: &str = include_str!("../src/api/pages.rs");

#[test]
fn state_signatures_are_compared_in_constant_time() {
    assert!(
        STATE_SOURCE.contains("verify_slice"),
        "state validation must use the Mac's constant-time verification"
    );
    assert!(
        STATE_SOURCE.contains("rejects_expired_tokens")
            || STATE_SOURCE.contains("token_expires_after_window"),
        "state expiry regression test must be present"
    );
}

#[test]
fn cipher_checks_context_before_decrypting() {
    let context_check = CIPHER_SOURCE.find("ContextMismatch").expect("context check must exist");
    let tag_check =
        CIPHER_SOURCE.find("AuthenticationFailed").expect("authentication check must exist");
    assert!(
        context_check < tag_check,
        "the context label must be rejected before tag verification is attempted"
    );
}

#[test]
fn forged_states_are_logged_distinctly_from_user_errors() {
    assert!(
        CALLBACK_SOURCE.contains("possible CSRF"),
        "failed state validation must be logged as suspected forgery"
    );
    assert!(
        CALLBACK_SOURCE.contains("error!"),
        "forgery suspicion must log at error level for security monitoring"
    );
}

#[test]
fn relay_fallback_never_uses_the_query_string() {
    assert!(
        PAGES_SOURCE.contains("#payload="),
        "the fallback redirect must carry the payload in the fragment"
    );
    assert!(
        !PAGES_SOURCE.contains("?payload="),
        "the payload must never appear in a query string where servers log it"
    );
}

#[test]
fn opener_revalidates_state_before_trusting_any_payload() {
    assert!(
        PAGES_SOURCE.contains("payload.state !== expected"),
        "the opener must re-validate the state token on every received payload"
    );
}
