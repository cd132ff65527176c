use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::{CheckResult, ValidationCtx, Validator};
use crate::error::Result;

/// How close to expiry a ServiceAccount token gets before we start warning.
fn near_expiry_window() -> ChronoDuration {
    ChronoDuration::hours(24)
}

/// Kubeconfig files are parsed with serde; an absurdly large file is
/// rejected before any parsing happens.
pub struct KubeconfigSize;

#[async_trait]
impl Validator for KubeconfigSize {
    fn name(&self) -> &'static str {
        "kubeconfig_size"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let mut oversized = Vec::new();
        for path in &cx.kubeconfig_paths {
            let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if len > cx.kubeconfig_max_bytes {
                oversized.push(format!("{} ({len} bytes)", path.display()));
            }
        }
        if oversized.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                format!(
                    "all kubeconfig files within {} bytes",
                    cx.kubeconfig_max_bytes
                ),
            ))
        } else {
            Ok(CheckResult::fail(
                self.name(),
                format!(
                    "kubeconfig files exceed the size ceiling: {}",
                    oversized.join(", ")
                ),
            ))
        }
    }
}

/// One named user entry from a kubeconfig document.
struct UserEntry {
    name: String,
    token: Option<String>,
}

fn read_users(raw: &str) -> Option<Vec<UserEntry>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(raw).ok()?;
    let users = doc.get("users")?.as_sequence()?;
    Some(
        users
            .iter()
            .filter_map(|u| {
                let name = u.get("name")?.as_str()?.to_string();
                let token = u
                    .get("user")
                    .and_then(|inner| inner.get("token"))
                    .and_then(|t| t.as_str())
                    .map(str::to_string);
                Some(UserEntry { name, token })
            })
            .collect(),
    )
}

/// Merged kubeconfigs silently shadow duplicate user entries, and expired
/// ServiceAccount tokens produce confusing auth failures mid-switchover.
/// Catch both up front.
pub struct KubeconfigIntegrity;

#[async_trait]
impl Validator for KubeconfigIntegrity {
    fn name(&self) -> &'static str {
        "kubeconfig_integrity"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let mut duplicates = Vec::new();
        let mut expired = Vec::new();
        let mut near_expiry = Vec::new();

        let mut seen_users: HashMap<String, &Path> = HashMap::new();
        for path in &cx.kubeconfig_paths {
            let Ok(raw) = std::fs::read_to_string(path) else {
                return Ok(CheckResult::fail(
                    self.name(),
                    format!("failed to read kubeconfig {}", path.display()),
                ));
            };
            let Some(users) = read_users(&raw) else {
                return Ok(CheckResult::fail(
                    self.name(),
                    format!("failed to parse kubeconfig {}", path.display()),
                ));
            };
            for user in users {
                if let Some(first) = seen_users.get(&user.name) {
                    if *first != path.as_path() {
                        duplicates.push(user.name.clone());
                    }
                } else {
                    seen_users.insert(user.name.clone(), path.as_path());
                }

                if let Some(token) = &user.token
                    && let Some(expiry) = jwt_expiry(token)
                {
                    let now = Utc::now();
                    if expiry <= now {
                        expired.push(format!("{} (expired {expiry})", user.name));
                    } else if expiry - now < near_expiry_window() {
                        near_expiry.push(format!("{} (expires {expiry})", user.name));
                    }
                }
            }
        }

        if !expired.is_empty() {
            return Ok(CheckResult::fail(
                self.name(),
                format!("expired ServiceAccount tokens: {}", expired.join(", ")),
            ));
        }
        if !duplicates.is_empty() || !near_expiry.is_empty() {
            let mut notes = Vec::new();
            if !duplicates.is_empty() {
                notes.push(format!(
                    "duplicate user entries across kubeconfig files: {}",
                    duplicates.join(", ")
                ));
            }
            if !near_expiry.is_empty() {
                notes.push(format!("tokens near expiry: {}", near_expiry.join(", ")));
            }
            return Ok(CheckResult::warn(self.name(), notes.join("; ")));
        }
        Ok(CheckResult::pass(
            self.name(),
            "kubeconfig entries are unambiguous and tokens are fresh",
        ))
    }
}

/// Pull `exp` out of a JWT without verifying it; only freshness matters
/// here, not authenticity.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::<Utc>::from_timestamp(exp, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_exp(exp: i64) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(b"{\"alg\":\"RS256\"}");
        let payload = engine.encode(format!("{{\"exp\":{exp}}}").as_bytes());
        format!("{header}.{payload}.signature")
    }

    #[test]
    fn expiry_is_extracted_from_unverified_jwt() {
        let expiry = jwt_expiry(&token_with_exp(1_900_000_000)).expect("expiry");
        assert_eq!(expiry.timestamp(), 1_900_000_000);
    }

    #[test]
    fn malformed_tokens_are_ignored() {
        assert!(jwt_expiry("opaque-token").is_none());
        assert!(jwt_expiry("a.b").is_none());
        assert!(jwt_expiry("a.b.c.d").is_none());
        assert!(jwt_expiry(&format!("x.{}.y", "!!!notbase64")).is_none());
    }

    #[test]
    fn users_and_tokens_parse_from_kubeconfig_yaml() {
        let raw = format!(
            concat!(
                "apiVersion: v1\n",
                "kind: Config\n",
                "users:\n",
                "- name: admin\n",
                "  user:\n",
                "    token: {}\n",
                "- name: cert-user\n",
                "  user:\n",
                "    client-certificate-data: abcd\n",
            ),
            token_with_exp(1_900_000_000)
        );
        let users = read_users(&raw).expect("parse");
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "admin");
        assert!(users[0].token.is_some());
        assert!(users[1].token.is_none());
    }
}
