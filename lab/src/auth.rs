//! Credentials used when the SDK calls the Transformer Lab API.
//!
//! The host application logs in and then hands the resulting browser cookies (or a sealed
//! session token) to the SDK, which forwards them on API requests such as the organization lookup
//! in [`workspace`](crate::workspace).

use serde::{Deserialize, Serialize};

/// Name of the cookie carrying a sealed session token.
pub const SEALED_SESSION_COOKIE: &str = "wos-session";

/// A cookie as supplied by the host application.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CookieSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
}

/// A validated cookie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
}

/// Session credentials for API calls.
#[derive(Clone, Debug, Default)]
pub struct Session {
    cookies: Vec<Cookie>,
    sealed_session: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cookie set.
    ///
    /// Entries without a name or without a value are skipped. Missing domains default to
    /// `localhost` and missing paths to `/`.
    pub fn set_cookies(&mut self, cookies: impl IntoIterator<Item = CookieSpec>) {
        self.cookies = cookies
            .into_iter()
            .filter_map(|spec| {
                let name = spec.name.filter(|name| !name.is_empty())?;
                let value = spec.value?;
                Some(Cookie {
                    name,
                    value,
                    domain: spec.domain.unwrap_or_else(|| "localhost".into()),
                    path: spec.path.unwrap_or_else(|| "/".into()),
                    secure: spec.secure,
                })
            })
            .collect();
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn set_sealed_session(&mut self, token: Option<String>) {
        self.sealed_session = token;
    }

    pub fn sealed_session(&self) -> Option<&str> {
        self.sealed_session.as_deref()
    }

    /// Render the `Cookie` request header, if there is anything to send.
    pub fn cookie_header(&self) -> Option<String> {
        let mut pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect();
        if let Some(token) = &self.sealed_session {
            if !self.cookies.iter().any(|c| c.name == SEALED_SESSION_COOKIE) {
                pairs.push(format!("{SEALED_SESSION_COOKIE}={token}"));
            }
        }
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_cookies_skips_incomplete() {
        let specs: Vec<CookieSpec> = serde_json::from_value(json!([
            {"name": "session", "value": "abc"},
            {"name": "org", "value": "42", "domain": "lab.example.com", "path": "/api", "secure": true},
            {"value": "orphan"},
            {"name": "novalue"},
        ]))
        .unwrap();

        let mut session = Session::new();
        session.set_cookies(specs);
        assert_eq!(
            session.cookies(),
            &[
                Cookie {
                    name: "session".into(),
                    value: "abc".into(),
                    domain: "localhost".into(),
                    path: "/".into(),
                    secure: false,
                },
                Cookie {
                    name: "org".into(),
                    value: "42".into(),
                    domain: "lab.example.com".into(),
                    path: "/api".into(),
                    secure: true,
                },
            ]
        );
        assert_eq!(session.cookie_header().unwrap(), "session=abc; org=42");
    }

    #[test]
    fn test_sealed_session_header() {
        let mut session = Session::new();
        assert_eq!(session.cookie_header(), None);

        session.set_sealed_session(Some("sealed".into()));
        assert_eq!(session.cookie_header().unwrap(), "wos-session=sealed");

        session.set_sealed_session(None);
        assert_eq!(session.sealed_session(), None);
        assert_eq!(session.cookie_header(), None);
    }
}
