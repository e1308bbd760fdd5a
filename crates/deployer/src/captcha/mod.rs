//! Captcha broker — one-time challenge tokens with a pluggable scheme.
//!
//! The broker owns an ephemeral, process-local table of outstanding
//! challenges. Entries are single-use: verification consumes the entry
//! whatever the outcome, so a captcha id can never be replayed.

use base64::Engine;
use dashmap::DashMap;
use rand::Rng;
use uuid::Uuid;

/// A generated challenge: what the user sees and what we expect back.
pub struct GeneratedCaptcha {
    pub answer: String,
    /// Complete data URI, ready for an `<img src=…>`.
    pub image_data_uri: String,
}

/// Pluggable challenge generator. The shipped implementation is trivial
/// arithmetic; stronger schemes drop in behind this trait.
pub trait CaptchaScheme: Send + Sync {
    fn generate(&self) -> GeneratedCaptcha;
}

/// `a op b` with small operands, rendered as an SVG data URI.
pub struct ArithmeticScheme;

impl CaptchaScheme for ArithmeticScheme {
    fn generate(&self) -> GeneratedCaptcha {
        let mut rng = rand::thread_rng();
        let a: i32 = rng.gen_range(1..10);
        let b: i32 = rng.gen_range(1..10);
        let (question, answer) = match rng.gen_range(0..3) {
            0 => (format!("{} + {}", a, b), a + b),
            1 => (format!("{} × {}", a.max(b), a.min(b)), a * b),
            _ => (format!("{} − {}", a.max(b), a.min(b)), a.max(b) - a.min(b)),
        };

        GeneratedCaptcha {
            answer: answer.to_string(),
            image_data_uri: render_svg_data_uri(&question),
        }
    }
}

fn render_svg_data_uri(question: &str) -> String {
    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="160" height="60"><rect width="100%" height="100%" fill="#f2f2f2"/><text x="80" y="38" font-family="monospace" font-size="26" text-anchor="middle" fill="#222">{} = ?</text></svg>"##,
        question
    );
    format!(
        "data:image/svg+xml;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(svg.as_bytes())
    )
}

struct CaptchaEntry {
    answer: String,
    expires_at: i64,
}

pub struct CaptchaBroker {
    scheme: Box<dyn CaptchaScheme>,
    entries: DashMap<String, CaptchaEntry>,
    ttl_sec: i64,
    bypass: bool,
}

/// What the API hands to the client.
pub struct IssuedCaptcha {
    pub id: String,
    pub image_data_uri: String,
}

impl CaptchaBroker {
    pub fn new(scheme: Box<dyn CaptchaScheme>, ttl_sec: i64, bypass: bool) -> Self {
        Self {
            scheme,
            entries: DashMap::new(),
            ttl_sec,
            bypass,
        }
    }

    pub fn issue(&self, now: i64) -> IssuedCaptcha {
        let generated = self.scheme.generate();
        let id = Uuid::new_v4().to_string();
        self.entries.insert(
            id.clone(),
            CaptchaEntry {
                answer: generated.answer,
                expires_at: now + self.ttl_sec,
            },
        );
        IssuedCaptcha {
            id,
            image_data_uri: generated.image_data_uri,
        }
    }

    /// Consume-and-check. The entry is removed on every outcome; unknown
    /// id, wrong answer, and expiry all reject.
    pub fn verify(&self, id: &str, answer: &str, now: i64) -> bool {
        if self.bypass {
            return true;
        }
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        if now > entry.expires_at {
            return false;
        }
        entry.answer == answer.trim()
    }

    /// Drop expired entries; called by the sweeper.
    pub fn purge_expired(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at >= now);
        before - self.entries.len()
    }

    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic scheme for broker tests.
    struct FixedScheme;

    impl CaptchaScheme for FixedScheme {
        fn generate(&self) -> GeneratedCaptcha {
            GeneratedCaptcha {
                answer: "7".to_string(),
                image_data_uri: "data:image/svg+xml;base64,Zm9v".to_string(),
            }
        }
    }

    fn broker() -> CaptchaBroker {
        CaptchaBroker::new(Box::new(FixedScheme), 120, false)
    }

    #[test]
    fn test_correct_answer_accepted_once() {
        let b = broker();
        let issued = b.issue(1000);
        assert!(b.verify(&issued.id, "7", 1010));
        // Single use: the same id never verifies twice.
        assert!(!b.verify(&issued.id, "7", 1011));
    }

    #[test]
    fn test_wrong_answer_rejected_and_consumed() {
        let b = broker();
        let issued = b.issue(1000);
        assert!(!b.verify(&issued.id, "8", 1010));
        // Consumed on failure too; no retry on the same id.
        assert!(!b.verify(&issued.id, "7", 1010));
    }

    #[test]
    fn test_expired_entry_rejected() {
        let b = broker();
        let issued = b.issue(1000);
        assert!(!b.verify(&issued.id, "7", 1000 + 121));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let b = broker();
        assert!(!b.verify("nope", "7", 1000));
    }

    #[test]
    fn test_answer_whitespace_tolerated() {
        let b = broker();
        let issued = b.issue(1000);
        assert!(b.verify(&issued.id, " 7 ", 1010));
    }

    #[test]
    fn test_bypass_mode_accepts_anything() {
        let b = CaptchaBroker::new(Box::new(FixedScheme), 120, true);
        assert!(b.verify("whatever", "nonsense", 0));
    }

    #[test]
    fn test_purge_drops_only_expired() {
        let b = broker();
        let old = b.issue(1000);
        let fresh = b.issue(1100);
        let dropped = b.purge_expired(1150);
        assert_eq!(dropped, 1);
        assert!(!b.verify(&old.id, "7", 1150));
        assert!(b.verify(&fresh.id, "7", 1150));
    }

    #[test]
    fn test_arithmetic_scheme_produces_numeric_answer() {
        let generated = ArithmeticScheme.generate();
        assert!(generated.answer.parse::<i32>().is_ok());
        assert!(generated.image_data_uri.starts_with("data:image/svg+xml;base64,"));
    }
}
