//! Delivery composition: spintax, variable substitution, tracking
//! instrumentation, and the unsubscribe footer.
//!
//! Rendering is pure aside from the injected RNG — the same step renders
//! differently per recipient because each spintax group is resolved by a
//! fresh uniform choice. Missing template variables resolve to the empty
//! string, never an error.

use std::collections::HashMap;
use std::sync::LazyLock;

use hmac::{Hmac, Mac};
use rand::Rng;
use regex::{Captures, Regex};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use uuid::Uuid;

use crate::model::{Lead, SequenceStep};

type HmacSha256 = Hmac<Sha256>;

static SPINTAX_RE: LazyLock<Regex> = LazyLock::new(|| {
    // A group must contain at least one `|` and no nested braces, so
    // `{{variable}}` placeholders are never touched.
    Regex::new(r"\{([^{}|]*(?:\|[^{}|]*)+)\}").unwrap_or_else(|e| panic!("spintax regex: {e}"))
});

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap_or_else(|e| panic!("variable regex: {e}"))
});

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href\s*=\s*"([^"]+)""#).unwrap_or_else(|e| panic!("href regex: {e}"))
});

/// Resolve every spintax group `{a|b|c}` by uniform random choice.
///
/// Groups are resolved innermost-first, so nesting one level deep works too.
pub fn resolve_spintax<R: Rng + ?Sized>(text: &str, rng: &mut R) -> String {
    let mut out = text.to_string();
    // Each pass resolves all non-nested groups; repeat until stable.
    for _ in 0..8 {
        if !SPINTAX_RE.is_match(&out) {
            break;
        }
        out = SPINTAX_RE
            .replace_all(&out, |caps: &Captures| {
                let options: Vec<&str> = caps[1].split('|').collect();
                options[rng.gen_range(0..options.len())].to_string()
            })
            .into_owned();
    }
    out
}

/// Substitute `{{variable}}` placeholders. Unknown variables become "".
pub fn substitute_variables(text: &str, vars: &HashMap<String, String>) -> String {
    VARIABLE_RE
        .replace_all(text, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Template variables available for a lead: `email` plus all custom fields.
pub fn lead_variables(lead: &Lead) -> HashMap<String, String> {
    let mut vars = lead.custom_fields.clone();
    vars.insert("email".to_string(), lead.email.clone());
    vars
}

// ── Tracking URL signing ────────────────────────────────────────────

/// Signs and verifies tracking tokens with HMAC-SHA256 over the workspace
/// signing secret. Tokens are hex-encoded MACs; the tracked values travel in
/// the URL path alongside them.
#[derive(Clone)]
pub struct LinkSigner {
    secret: SecretString,
}

impl LinkSigner {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self, message: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(message.as_bytes());
        mac
    }

    pub fn sign_open(&self, log_id: Uuid) -> String {
        hex::encode(self.mac(&format!("open:{log_id}")).finalize().into_bytes())
    }

    pub fn verify_open(&self, log_id: Uuid, sig: &str) -> bool {
        let Ok(bytes) = hex::decode(sig) else {
            return false;
        };
        self.mac(&format!("open:{log_id}")).verify_slice(&bytes).is_ok()
    }

    pub fn sign_click(&self, log_id: Uuid, url: &str) -> String {
        hex::encode(
            self.mac(&format!("click:{log_id}:{url}"))
                .finalize()
                .into_bytes(),
        )
    }

    pub fn verify_click(&self, log_id: Uuid, url: &str, sig: &str) -> bool {
        let Ok(bytes) = hex::decode(sig) else {
            return false;
        };
        self.mac(&format!("click:{log_id}:{url}"))
            .verify_slice(&bytes)
            .is_ok()
    }
}

// ── Composer ────────────────────────────────────────────────────────

/// A rendered outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedEmail {
    pub subject: String,
    pub html_body: String,
}

/// Per-send instrumentation flags.
#[derive(Debug, Clone, Copy)]
pub struct ComposeFlags {
    pub track_opens: bool,
    pub track_clicks: bool,
}

/// Renders personalized, instrumented message bodies.
#[derive(Clone)]
pub struct Composer {
    base_url: String,
    signer: LinkSigner,
}

impl Composer {
    pub fn new(base_url: impl Into<String>, signer: LinkSigner) -> Self {
        Self {
            base_url: base_url.into(),
            signer,
        }
    }

    pub fn signer(&self) -> &LinkSigner {
        &self.signer
    }

    /// Render one step for one lead.
    pub fn compose<R: Rng + ?Sized>(
        &self,
        step: &SequenceStep,
        lead: &Lead,
        log_id: Uuid,
        flags: ComposeFlags,
        rng: &mut R,
    ) -> ComposedEmail {
        let vars = lead_variables(lead);
        let subject = substitute_variables(&resolve_spintax(&step.subject, rng), &vars);
        let mut body = substitute_variables(&resolve_spintax(&step.body, rng), &vars);

        if flags.track_clicks {
            body = self.rewrite_links(&body, log_id);
        }
        if flags.track_opens {
            body.push_str(&self.tracking_pixel(log_id));
        }
        body.push_str(&self.unsubscribe_footer(lead.id));

        ComposedEmail {
            subject,
            html_body: body,
        }
    }

    /// Rewrite anchor hrefs to signed redirect URLs. `mailto:` links and the
    /// unsubscribe link are left alone.
    fn rewrite_links(&self, html: &str, log_id: Uuid) -> String {
        HREF_RE
            .replace_all(html, |caps: &Captures| {
                let url = &caps[1];
                if url.starts_with("mailto:") || url.contains("/u/") {
                    caps[0].to_string()
                } else {
                    let sig = self.signer.sign_click(log_id, url);
                    format!(
                        r#"href="{}/t/click/{}/{}/{}""#,
                        self.base_url,
                        log_id,
                        hex::encode(url.as_bytes()),
                        sig
                    )
                }
            })
            .into_owned()
    }

    fn tracking_pixel(&self, log_id: Uuid) -> String {
        let sig = self.signer.sign_open(log_id);
        format!(
            r#"<img src="{}/t/open/{}/{}" width="1" height="1" alt="" />"#,
            self.base_url, log_id, sig
        )
    }

    /// One-click unsubscribe target, also used for the List-Unsubscribe
    /// header.
    pub fn unsubscribe_url(&self, lead_id: Uuid) -> String {
        format!("{}/u/{}", self.base_url, lead_id)
    }

    fn unsubscribe_footer(&self, lead_id: Uuid) -> String {
        format!(
            r#"<p><a href="{}">Unsubscribe</a></p>"#,
            self.unsubscribe_url(lead_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn test_lead() -> Lead {
        let mut fields = HashMap::new();
        fields.insert("first_name".to_string(), "Ada".to_string());
        fields.insert("company".to_string(), "Acme".to_string());
        Lead {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            email: "ada@acme.test".to_string(),
            status: crate::model::LeadStatus::Queued,
            campaign_id: None,
            last_event_at: Some(Utc::now()),
            tags: vec![],
            custom_fields: fields,
        }
    }

    fn test_step(subject: &str, body: &str) -> SequenceStep {
        SequenceStep {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            order: 0,
            subject: subject.to_string(),
            body: body.to_string(),
            delay_days: 0,
            wait_minutes: None,
            send_at: None,
        }
    }

    fn composer() -> Composer {
        Composer::new(
            "https://track.test",
            LinkSigner::new(SecretString::from("test-secret")),
        )
    }

    #[test]
    fn spintax_picks_one_option() {
        let mut rng = rng();
        let out = resolve_spintax("{Hi|Hello|Hey} there", &mut rng);
        assert!(["Hi there", "Hello there", "Hey there"].contains(&out.as_str()));
    }

    #[test]
    fn spintax_eventually_picks_every_option() {
        let mut rng = rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(resolve_spintax("{a|b|c}", &mut rng));
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn spintax_leaves_plain_text_alone() {
        let mut rng = rng();
        assert_eq!(resolve_spintax("no groups here", &mut rng), "no groups here");
    }

    #[test]
    fn spintax_does_not_touch_variables() {
        let mut rng = rng();
        assert_eq!(
            resolve_spintax("Hi {{first_name}}", &mut rng),
            "Hi {{first_name}}"
        );
    }

    #[test]
    fn variables_substitute_from_fields() {
        let vars = lead_variables(&test_lead());
        assert_eq!(
            substitute_variables("Hi {{first_name}} at {{company}}", &vars),
            "Hi Ada at Acme"
        );
    }

    #[test]
    fn missing_variable_resolves_to_empty_string() {
        let vars = lead_variables(&test_lead());
        assert_eq!(substitute_variables("Hi {{nickname}}!", &vars), "Hi !");
    }

    #[test]
    fn email_is_always_available_as_variable() {
        let vars = lead_variables(&test_lead());
        assert_eq!(
            substitute_variables("{{email}}", &vars),
            "ada@acme.test"
        );
    }

    #[test]
    fn compose_appends_unsubscribe_footer() {
        let lead = test_lead();
        let email = composer().compose(
            &test_step("Hello", "<p>Body</p>"),
            &lead,
            Uuid::new_v4(),
            ComposeFlags {
                track_opens: false,
                track_clicks: false,
            },
            &mut rng(),
        );
        assert!(email.html_body.contains(&format!("/u/{}", lead.id)));
    }

    #[test]
    fn compose_adds_pixel_when_tracking_opens() {
        let log_id = Uuid::new_v4();
        let email = composer().compose(
            &test_step("Hello", "<p>Body</p>"),
            &test_lead(),
            log_id,
            ComposeFlags {
                track_opens: true,
                track_clicks: false,
            },
            &mut rng(),
        );
        assert!(email.html_body.contains(&format!("/t/open/{log_id}/")));
        assert!(email.html_body.contains(r#"width="1" height="1""#));
    }

    #[test]
    fn compose_rewrites_http_links_but_not_mailto() {
        let log_id = Uuid::new_v4();
        let body = r#"<a href="https://example.com/x">x</a> <a href="mailto:me@test.com">mail</a>"#;
        let email = composer().compose(
            &test_step("Hello", body),
            &test_lead(),
            log_id,
            ComposeFlags {
                track_opens: false,
                track_clicks: true,
            },
            &mut rng(),
        );
        assert!(email.html_body.contains(&format!("/t/click/{log_id}/")));
        assert!(!email.html_body.contains(r#"href="https://example.com/x""#));
        assert!(email.html_body.contains(r#"href="mailto:me@test.com""#));
    }

    #[test]
    fn rewritten_click_link_verifies() {
        let c = composer();
        let log_id = Uuid::new_v4();
        let sig = c.signer().sign_click(log_id, "https://example.com/x");
        assert!(c.signer().verify_click(log_id, "https://example.com/x", &sig));
        assert!(!c.signer().verify_click(log_id, "https://evil.test", &sig));
    }

    #[test]
    fn tampered_open_signature_fails() {
        let c = composer();
        let log_id = Uuid::new_v4();
        let sig = c.signer().sign_open(log_id);
        assert!(c.signer().verify_open(log_id, &sig));
        assert!(!c.signer().verify_open(Uuid::new_v4(), &sig));
        assert!(!c.signer().verify_open(log_id, "not-hex"));
    }

    #[test]
    fn subject_supports_spintax_and_variables() {
        let email = composer().compose(
            &test_step("{Quick|Fast} question for {{first_name}}", "b"),
            &test_lead(),
            Uuid::new_v4(),
            ComposeFlags {
                track_opens: false,
                track_clicks: false,
            },
            &mut rng(),
        );
        assert!(
            email.subject == "Quick question for Ada" || email.subject == "Fast question for Ada"
        );
    }
}
