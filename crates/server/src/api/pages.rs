// Server-rendered pages carrying the OAuth outcome across browsing
// contexts.
//
// The callback runs in a popup that may not share an origin with the
// opener, may have no scripted opener at all (mobile browsers), or may
// lose the message channel before delivery. Three channels cover this:
//
//   1. postMessage to every origin on the allow-list (primary),
//   2. a durable localStorage entry under a fixed key,
//   3. a redirect to the relay path with the payload in the URL
//      fragment — never the query string, so it cannot land in server
//      logs — where the relay page re-stores and re-forwards it.
//
// The opener page listens on message AND storage events, checks the
// stored key synchronously when attaching and once more on timeout or
// popup close, and re-validates every payload against its own state
// token before trusting it. First accepted payload wins; all listeners
// are then torn down.

use serde::Serialize;

use crate::slack::AppIdentity;

/// localStorage key for the durable fallback channel.
pub const RESULT_STORAGE_KEY: &str = "slackAuthResult";
/// sessionStorage key the opener keeps its outstanding state under.
pub const STATE_STORAGE_KEY: &str = "slackAuthState";
/// Well-known fallback relay path.
pub const RELAY_PATH: &str = "/slack-auth";
/// How long the opener waits for a payload before giving up.
pub const RELAY_TIMEOUT_MS: u64 = 300_000;
/// Popup liveness poll interval.
pub const POPUP_POLL_INTERVAL_MS: u64 = 1_000;
/// Grace period between seeing the popup closed and the final storage
/// re-check.
pub const POPUP_CLOSE_GRACE_MS: u64 = 1_500;

/// The payload ferried from the callback context to the opener.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RelayPayload {
    #[serde(rename = "SLACK_AUTH_SUCCESS")]
    Success { user: AppIdentity, state: String },
    #[serde(rename = "SLACK_AUTH_ERROR")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
}

/// Serialize for embedding inside a `<script>` block. In JSON output
/// `<` only occurs inside string literals, where the unicode escape
/// form is equivalent, so payload content can never terminate the
/// script element or open a new tag.
fn embed_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_owned())
        .replace('<', "\\u003c")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const RESULT_SCRIPT: &str = r#"
      const payload = __PAYLOAD__;
      const origins = __ORIGINS__;

      // Primary channel: try every allowed origin until one send goes
      // through without throwing.
      origins.forEach((origin) => {
        try {
          if (window.opener) {
            window.opener.postMessage(payload, origin);
          }
        } catch (e) { /* try the next origin */ }
      });

      // Durable fallback for the same-origin case.
      try {
        localStorage.setItem('__RESULT_KEY__', JSON.stringify(payload));
      } catch (e) { /* storage may be unavailable */ }

      setTimeout(() => {
        try { window.close(); } catch (e) { /* not script-closable */ }
        // Still open: no scripted opener. Carry the payload to the relay
        // page in the fragment so it stays out of server logs.
        window.location.replace(
          '__RELAY_PATH__#payload=' + encodeURIComponent(JSON.stringify(payload))
        );
      }, 800);
"#;

fn result_page(heading: &str, message: &str, payload: &RelayPayload, origins: &[String]) -> String {
    let script = RESULT_SCRIPT
        .replace("__PAYLOAD__", &embed_json(payload))
        .replace("__ORIGINS__", &embed_json(&origins))
        .replace("__RESULT_KEY__", RESULT_STORAGE_KEY)
        .replace("__RELAY_PATH__", RELAY_PATH);

    format!(
        r#"<!doctype html>
<html lang="ja">
  <head>
    <meta charset="utf-8">
    <title>Slack認証</title>
  </head>
  <body>
    <h1>{}</h1>
    <p>{}</p>
    <script>{}</script>
  </body>
</html>
"#,
        escape_html(heading),
        escape_html(message),
        script
    )
}

/// Popup result page for a completed login.
pub fn success_page(identity: &AppIdentity, state: &str, origins: &[String]) -> String {
    let payload =
        RelayPayload::Success { user: identity.clone(), state: state.to_owned() };
    result_page(
        "認証成功",
        "Slackログインが完了しました。このウィンドウは自動的に閉じられます。",
        &payload,
        origins,
    )
}

/// Popup result page for a failed login. Also used for every callback
/// error path so the opener is informed instead of waiting out the
/// timeout.
pub fn error_page(error: &str, state: Option<&str>, origins: &[String]) -> String {
    let payload = RelayPayload::Error {
        error: error.to_owned(),
        state: state.map(ToOwned::to_owned),
    };
    result_page(
        "認証エラー",
        &format!("Slack認証に失敗しました: {error}"),
        &payload,
        origins,
    )
}

const RELAY_SCRIPT: &str = r#"
      const hashParams = new URLSearchParams(window.location.hash.replace(/^#/, ''));
      const raw = hashParams.get('payload');
      if (raw) {
        try {
          const payload = JSON.parse(decodeURIComponent(raw));
          try {
            localStorage.setItem('__RESULT_KEY__', JSON.stringify(payload));
          } catch (e) { /* storage may be unavailable */ }
          if (window.opener) {
            try {
              window.opener.postMessage(payload, window.location.origin);
            } catch (e) { /* opener gone */ }
          }
        } catch (e) { /* malformed fragment */ }
      }
      setTimeout(() => {
        try { window.close(); } catch (e) { /* not script-closable */ }
      }, 500);
"#;

/// The fallback relay page: re-store the fragment payload under the
/// durable key, forward to the opener when one exists, then close.
pub fn relay_page() -> String {
    let script = RELAY_SCRIPT.replace("__RESULT_KEY__", RESULT_STORAGE_KEY);
    format!(
        r#"<!doctype html>
<html lang="ja">
  <head>
    <meta charset="utf-8">
    <title>Slack認証</title>
  </head>
  <body>
    <p>認証処理を完了しています...</p>
    <script>{script}</script>
  </body>
</html>
"#
    )
}

const LOGIN_SCRIPT: &str = r#"
      const AUTHORIZE_URL = __AUTHORIZE_URL__;
      const RESULT_KEY = '__RESULT_KEY__';
      const STATE_KEY = '__STATE_KEY__';
      const TIMEOUT_MS = __TIMEOUT_MS__;
      const POLL_MS = __POLL_MS__;
      const GRACE_MS = __GRACE_MS__;

      function show(text) {
        document.getElementById('status').textContent = text;
      }

      async function signInWithSlack() {
        const response = await fetch('/auth/slack/state', { method: 'POST' });
        const body = await response.json();
        if (!body.success) {
          show('認証の開始に失敗しました。');
          return;
        }
        sessionStorage.setItem(STATE_KEY, body.state);

        const popup = window.open(
          AUTHORIZE_URL + '&state=' + encodeURIComponent(body.state),
          'SlackAuth',
          'width=600,height=700,scrollbars=yes,resizable=yes'
        );
        if (!popup) {
          show('ポップアップがブロックされました。ブラウザの設定を確認してください。');
          return;
        }

        let settled = false;
        let timeoutId = null;
        let pollId = null;

        function teardown() {
          settled = true;
          window.removeEventListener('message', onMessage);
          window.removeEventListener('storage', onStorage);
          clearTimeout(timeoutId);
          clearInterval(pollId);
        }

        function readStored() {
          try {
            return JSON.parse(localStorage.getItem(RESULT_KEY));
          } catch (e) {
            return null;
          }
        }

        // First valid, state-verified payload from any channel wins.
        function accept(payload) {
          if (settled || !payload) return false;
          const expected = sessionStorage.getItem(STATE_KEY);
          if (payload.type === 'SLACK_AUTH_SUCCESS') {
            if (!expected || payload.state !== expected) return false;
            teardown();
            sessionStorage.removeItem(STATE_KEY);
            try { localStorage.removeItem(RESULT_KEY); } catch (e) {}
            try { popup.close(); } catch (e) {}
            sessionStorage.setItem('slackAuthUser', JSON.stringify(payload.user));
            show('ようこそ、' + payload.user.name + 'さん');
            return true;
          }
          if (payload.type === 'SLACK_AUTH_ERROR') {
            if (payload.state && expected && payload.state !== expected) return false;
            teardown();
            try { localStorage.removeItem(RESULT_KEY); } catch (e) {}
            try { popup.close(); } catch (e) {}
            show('認証エラー: ' + payload.error);
            return true;
          }
          return false;
        }

        function onMessage(event) {
          accept(event.data);
        }

        function onStorage(event) {
          if (event.key !== RESULT_KEY || !event.newValue) return;
          try {
            accept(JSON.parse(event.newValue));
          } catch (e) { /* malformed entry */ }
        }

        window.addEventListener('message', onMessage);
        window.addEventListener('storage', onStorage);
        // The value may have been written before the listeners attached.
        accept(readStored());

        timeoutId = setTimeout(() => {
          if (settled) return;
          if (!accept(readStored())) {
            teardown();
            show('認証がタイムアウトしました。再度お試しください。');
          }
        }, TIMEOUT_MS);

        pollId = setInterval(() => {
          if (settled) return;
          if (popup.closed) {
            clearInterval(pollId);
            setTimeout(() => {
              if (!settled && !accept(readStored())) {
                teardown();
                show('認証がキャンセルされました。');
              }
            }, GRACE_MS);
          }
        }, POLL_MS);
      }

      document.getElementById('login').addEventListener('click', signInWithSlack);
"#;

/// The opener page: starts the login, then waits on both relay channels.
pub fn login_page(authorize_url: &str) -> String {
    let script = LOGIN_SCRIPT
        .replace("__AUTHORIZE_URL__", &embed_json(&authorize_url))
        .replace("__RESULT_KEY__", RESULT_STORAGE_KEY)
        .replace("__STATE_KEY__", STATE_STORAGE_KEY)
        .replace("__TIMEOUT_MS__", &RELAY_TIMEOUT_MS.to_string())
        .replace("__POLL_MS__", &POPUP_POLL_INTERVAL_MS.to_string())
        .replace("__GRACE_MS__", &POPUP_CLOSE_GRACE_MS.to_string());

    format!(
        r#"<!doctype html>
<html lang="ja">
  <head>
    <meta charset="utf-8">
    <title>入退室管理</title>
  </head>
  <body>
    <h1>研究室入退室管理システム</h1>
    <button id="login">Slackでログイン</button>
    <p id="status"></p>
    <script>{script}</script>
  </body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::{
        error_page, login_page, relay_page, success_page, RelayPayload, RELAY_PATH,
        RELAY_TIMEOUT_MS, RESULT_STORAGE_KEY,
    };
    use crate::slack::AppIdentity;

    fn identity() -> AppIdentity {
        AppIdentity {
            uid: "slack_U1".into(),
            name: "Taro".into(),
            email: "taro@example.jp".into(),
            avatar: "http://x/a.png".into(),
            provider: "slack".into(),
            slack_user_id: "U1".into(),
            slack_team_id: "T1".into(),
        }
    }

    fn origins() -> Vec<String> {
        vec!["http://localhost:5173".into(), "https://app.example.jp".into()]
    }

    #[test]
    fn success_page_attempts_every_allowed_origin() {
        let page = success_page(&identity(), "state-abc", &origins());
        assert!(page.contains("http://localhost:5173"));
        assert!(page.contains("https://app.example.jp"));
        assert!(page.contains("window.opener.postMessage"));
    }

    #[test]
    fn success_page_embeds_typed_payload_with_state() {
        let page = success_page(&identity(), "state-abc", &origins());
        assert!(page.contains(r#""type":"SLACK_AUTH_SUCCESS""#));
        assert!(page.contains(r#""state":"state-abc""#));
        assert!(page.contains(r#""uid":"slack_U1""#));
        assert!(page.contains(r#""slackUserId":"U1""#));
    }

    #[test]
    fn fallback_carries_payload_in_fragment_not_query() {
        let page = success_page(&identity(), "state-abc", &origins());
        assert!(page.contains(&format!("'{RELAY_PATH}#payload='")));
        assert!(!page.contains(&format!("{RELAY_PATH}?payload=")));
        assert!(page.contains(RESULT_STORAGE_KEY));
    }

    #[test]
    fn error_page_escapes_markup_in_messages() {
        let page = error_page("<img src=x onerror=alert(1)>", None, &origins());
        assert!(!page.contains("<img src=x"));
        assert!(page.contains("&lt;img src=x"));
        assert!(page.contains(r#""type":"SLACK_AUTH_ERROR""#));
    }

    #[test]
    fn script_terminator_in_payload_is_neutralized() {
        let page = error_page("</script><script>alert(1)", None, &origins());
        assert!(!page.contains("</script><script>alert(1)"));
        // Inside the embedded JSON the angle bracket must be escaped.
        assert!(page.contains("\\u003c/script"));
    }

    #[test]
    fn relay_page_restores_and_forwards() {
        let page = relay_page();
        assert!(page.contains("location.hash"));
        assert!(page.contains(RESULT_STORAGE_KEY));
        assert!(page.contains("window.opener.postMessage"));
        assert!(page.contains("window.close()"));
    }

    #[test]
    fn login_page_listens_on_both_channels_with_timeout_and_poll() {
        let page = login_page("https://slack.com/oauth/v2/authorize?client_id=x");
        assert!(page.contains("addEventListener('message'"));
        assert!(page.contains("addEventListener('storage'"));
        assert!(page.contains(&RELAY_TIMEOUT_MS.to_string()));
        assert!(page.contains("popup.closed"));
        // State re-validation before trusting any payload.
        assert!(page.contains("payload.state !== expected"));
    }

    #[test]
    fn error_payload_state_is_omitted_when_absent() {
        let json = serde_json::to_string(&RelayPayload::Error {
            error: "denied".into(),
            state: None,
        })
        .expect("payload should serialize");
        assert!(!json.contains("state"));
    }
}
