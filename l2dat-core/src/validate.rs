//! Dry-run encoding of edited text.
//!
//! Validation may be requested on every edit. Each request gets a sequence
//! number; a request re-checks that it is still the newest before the work
//! and before publishing, and the receiving side only applies results that
//! are not older than what it already shows.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use rayon::ThreadPool;
use tracing::{debug, trace};

use crate::chronicle::descriptor::Descriptor;
use crate::codec::DatCodec;
use crate::crypto::DatCrypter;
use crate::error::DatError;
use crate::task::TaskContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// 1-based, 0 when unknown.
    pub line: usize,
    /// 1-based character offset into the text, 0 when unknown.
    pub offset: usize,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            line: 0,
            offset: 0,
            message: None,
        }
    }

    pub fn from_error(err: &DatError) -> Self {
        match err {
            DatError::MalformedText {
                line,
                offset,
                message,
            } => Self {
                is_valid: false,
                line: *line,
                offset: *offset,
                message: Some(message.clone()),
            },
            other => Self {
                is_valid: false,
                line: 0,
                offset: 0,
                message: Some(other.to_string()),
            },
        }
    }

    /// Status-line text, `None` for a valid result.
    pub fn format_message(&self) -> Option<String> {
        if self.is_valid {
            return None;
        }
        let msg = self.message.as_deref().unwrap_or("unknown error");
        Some(format!(
            "Validation error at line {} (offset {}): {msg}",
            self.line, self.offset
        ))
    }
}

/// Re-runs the encode path over `text` without writing anything.
///
/// With `dry_run == false` the payload is also encrypted in memory, so a
/// missing or unusable cipher fails validation too.
pub fn validate_data(
    ctx: &mut TaskContext,
    total_weight: f64,
    file: &str,
    cipher: Option<&DatCrypter>,
    descriptor: &Descriptor,
    text: &str,
    dry_run: bool,
) -> ValidationResult {
    let codec = DatCodec::new(descriptor);
    let outcome = codec
        .parse_text(text, ctx, total_weight * 0.8)
        .and_then(|records| {
            let payload = codec.encode(&records)?;
            ctx.add_progress(total_weight * 0.1, 100.0);
            if !dry_run {
                let cipher = cipher.ok_or_else(|| DatError::CipherNotFound {
                    cipher: "none".into(),
                    file: file.to_string(),
                })?;
                cipher.encrypt_file(file, &payload)?;
            }
            ctx.add_progress(total_weight * 0.1, 100.0);
            Ok(())
        });
    match outcome {
        Ok(()) => ValidationResult::ok(),
        Err(e) => {
            debug!(file, error = %e, "validation failed");
            ValidationResult::from_error(&e)
        }
    }
}

/// Character range to highlight for an error: from `offset` to the end of
/// its line. `None` when the offset is unknown or past the text.
pub fn error_span(text: &str, offset: usize) -> Option<Range<usize>> {
    if offset == 0 {
        return None;
    }
    let start = offset - 1;
    let mut end = start;
    let mut chars = text.chars().skip(start).peekable();
    chars.peek()?;
    for c in chars {
        if c == '\r' || c == '\n' {
            break;
        }
        end += 1;
    }
    Some(start..end)
}

/// Everything one validation run needs, owned so it can move to a worker.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub file: String,
    pub descriptor: Arc<Descriptor>,
    pub cipher: Option<Arc<DatCrypter>>,
    pub text: Arc<str>,
    pub dry_run: bool,
}

/// Runs validations on the shared pool and publishes `(sequence, result)`.
pub struct ValidationScheduler {
    pool: Arc<ThreadPool>,
    latest: Arc<AtomicU64>,
    tx: Sender<(u64, ValidationResult)>,
}

impl ValidationScheduler {
    pub fn new(pool: Arc<ThreadPool>) -> (Self, Receiver<(u64, ValidationResult)>) {
        let (tx, rx) = unbounded();
        let sched = Self {
            pool,
            latest: Arc::new(AtomicU64::new(0)),
            tx,
        };
        (sched, rx)
    }

    /// Hands out the next sequence number, making older requests stale.
    pub fn next_sequence(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Queues `request` and returns its sequence number.
    pub fn submit(&self, request: ValidationRequest) -> u64 {
        let seq = self.next_sequence();
        let latest = Arc::clone(&self.latest);
        let tx = self.tx.clone();
        self.pool.spawn(move || {
            if latest.load(Ordering::Acquire) != seq {
                trace!(seq, "validation superseded before start");
                return;
            }
            let result = validate_data(
                &mut TaskContext::detached(),
                100.0,
                &request.file,
                request.cipher.as_deref(),
                &request.descriptor,
                &request.text,
                request.dry_run,
            );
            if latest.load(Ordering::Acquire) != seq {
                trace!(seq, "validation superseded before publish");
                return;
            }
            let _ = tx.send((seq, result));
        });
        seq
    }
}

/// Receiving side: keeps the newest result and ignores stale ones.
#[derive(Debug, Default)]
pub struct LatestValidation {
    applied: Option<u64>,
    result: Option<ValidationResult>,
}

impl LatestValidation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `result` unless a newer sequence was already applied.
    pub fn apply(&mut self, seq: u64, result: ValidationResult) -> bool {
        if self.applied.is_some_and(|applied| seq < applied) {
            trace!(seq, "dropping stale validation result");
            return false;
        }
        self.applied = Some(seq);
        self.result = Some(result);
        true
    }

    pub fn sequence(&self) -> Option<u64> {
        self.applied
    }

    pub fn result(&self) -> Option<&ValidationResult> {
        self.result.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chronicle::descriptor::build_descriptor;
    use crate::crypto::xor::XorConst;
    use std::time::Duration;

    fn descriptor() -> Descriptor {
        build_descriptor(
            toml::from_str::<toml::Value>(
                r#"
                name = "itemname"
                files = ["ItemName-e.dat"]
                [[field]]
                name = "id"
                type = "u32"
                [[field]]
                name = "name"
                type = "ascf"
                [[field]]
                name = "weight"
                type = "i32"
                "#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn cipher() -> DatCrypter {
        DatCrypter::new("111", "Lineage2Ver111", Box::new(XorConst { key: 0xac }))
    }

    const GOOD: &str = "id=1\nname=Sword\nweight=1600\n\nid=2\nname=Shield\nweight=1200\n";

    #[test]
    fn valid_text_passes() {
        let r = validate_data(
            &mut TaskContext::detached(),
            100.0,
            "ItemName-e.dat",
            Some(&cipher()),
            &descriptor(),
            GOOD,
            false,
        );
        assert_eq!(r, ValidationResult::ok());
        assert_eq!(r.format_message(), None);
    }

    #[test]
    fn bad_field_reports_line_and_offset() {
        let text = GOOD.replace("weight=1200", "weight=heavy");
        let r = validate_data(
            &mut TaskContext::detached(),
            100.0,
            "ItemName-e.dat",
            None,
            &descriptor(),
            &text,
            true,
        );
        assert!(!r.is_valid);
        assert_eq!(r.line, 7);
        assert_eq!(r.offset, text.find("weight=heavy").unwrap() + 1);
        let msg = r.format_message().unwrap();
        assert!(msg.starts_with("Validation error at line 7 (offset "), "{msg}");
    }

    #[test]
    fn missing_cipher_fails_only_without_dry_run() {
        let d = descriptor();
        let dry = validate_data(&mut TaskContext::detached(), 100.0, "x.dat", None, &d, GOOD, true);
        assert!(dry.is_valid);
        let full = validate_data(&mut TaskContext::detached(), 100.0, "x.dat", None, &d, GOOD, false);
        assert!(!full.is_valid);
        assert_eq!((full.line, full.offset), (0, 0));
    }

    #[test]
    fn error_span_runs_to_line_end() {
        let text = "id=1\nname=x y\r\nweight=2";
        assert_eq!(error_span(text, 6), Some(5..13));
        assert_eq!(error_span(text, 0), None);
        assert_eq!(error_span(text, 100), None);
        assert_eq!(error_span(text, text.chars().count()), Some(22..23));
    }

    #[test]
    fn stale_result_never_overwrites_newer() {
        let mut latest = LatestValidation::new();
        assert!(latest.apply(6, ValidationResult::ok()));
        let stale = ValidationResult {
            is_valid: false,
            line: 1,
            offset: 1,
            message: Some("old".into()),
        };
        assert!(!latest.apply(5, stale));
        assert_eq!(latest.sequence(), Some(6));
        assert!(latest.result().unwrap().is_valid);
    }

    #[test]
    fn scheduler_publishes_only_the_newest_request() {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap());
        let (sched, rx) = ValidationScheduler::new(Arc::clone(&pool));

        // occupy the only worker so both requests queue up behind it
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        pool.spawn(move || {
            let _ = gate.recv_timeout(Duration::from_secs(10));
        });

        let req = |text: &str| ValidationRequest {
            file: "ItemName-e.dat".into(),
            descriptor: Arc::new(descriptor()),
            cipher: None,
            text: Arc::from(text),
            dry_run: true,
        };
        let first = sched.submit(req("id=oops"));
        let second = sched.submit(req(GOOD));
        assert!(second > first);
        release.send(()).unwrap();

        let (seq, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(seq, second);
        assert!(result.is_valid);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    /// Long-running action that holds the task slot until released.
    struct HoldSlot(crossbeam_channel::Receiver<()>);

    impl crate::task::Action for HoldSlot {
        fn name(&self) -> String {
            "hold".into()
        }

        fn run(&self, ctx: &mut TaskContext) -> crate::error::Result<()> {
            let _ = self.0.recv_timeout(Duration::from_secs(10));
            ctx.checkpoint()
        }
    }

    #[test]
    fn validation_runs_while_a_task_holds_the_only_worker() {
        let (runner, events) = crate::task::TaskRunner::new(1).unwrap();
        let (release, hold) = crossbeam_channel::bounded::<()>(1);
        runner.start(Box::new(HoldSlot(hold))).unwrap();
        assert!(runner.is_busy());

        let (sched, rx) = ValidationScheduler::new(runner.validation_pool());
        let seq = sched.submit(ValidationRequest {
            file: "ItemName-e.dat".into(),
            descriptor: Arc::new(descriptor()),
            cipher: None,
            text: Arc::from(GOOD),
            dry_run: true,
        });
        let (got, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, seq);
        assert!(result.is_valid);
        assert!(runner.is_busy());

        release.send(()).unwrap();
        assert_eq!(
            events.dispatch(&mut NoObserver),
            Some(crate::task::TaskStatus::Succeeded)
        );
    }

    struct NoObserver;

    impl crate::task::TaskObserver for NoObserver {}
}
