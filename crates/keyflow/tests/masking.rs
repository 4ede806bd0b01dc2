// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Property test: no log line produced by the core ever contains a raw
//! credential.
//!
//! Run with: `cargo test -p keyflow --test masking`

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use keyflow::{mask_credential, CredentialRegistry, ProviderConfig, UsageManager, UsageUpdate};

/// Captures everything the subscriber writes
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Exercise every log-producing path in the core with one credential
fn drive_logging_paths(accessor: &str) -> String {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_writer(capture.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let manager = UsageManager::new(
            "acme",
            ProviderConfig::default(),
            Arc::new(CredentialRegistry::new()),
            None,
        );
        let stable_id = manager.register_credential(accessor, Some(1), None, None);

        manager.record_success(&stable_id, "acme-large", UsageUpdate::success(), None, None);
        manager.apply_cooldown(accessor, 600.0, "rate_limit", Some("pool"));
        manager.mark_exhausted(accessor, "pool", "quota_exceeded");
        let _ = manager.select_credential("acme-large", Some("pool"), &HashSet::new(), 0.0);
        let _ = manager.availability_stats("acme-large", Some("pool"));
    });

    capture.contents()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn logs_never_contain_raw_keys(key in "sk-[A-Za-z0-9]{16,40}") {
        let logs = drive_logging_paths(&key);
        prop_assert!(!logs.is_empty(), "expected log output");
        prop_assert!(
            !logs.contains(&key),
            "raw credential leaked into logs: {logs}"
        );
    }

    #[test]
    fn mask_is_short_and_stable(key in "sk-[A-Za-z0-9]{16,40}") {
        let masked = mask_credential(&key);
        prop_assert_eq!(&masked, &mask_credential(&key));
        prop_assert!(masked.len() <= 12);
        prop_assert!(!key.contains(&masked));
    }
}

#[test]
fn email_accessors_keep_only_the_local_part() {
    let logs = drive_logging_paths("alice@example.com");
    assert!(!logs.contains("alice@example.com"));
    assert!(logs.contains("alice@…"));
}
