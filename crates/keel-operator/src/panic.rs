//! Panic isolation for handler invocations
//!
//! A panicking handler must not take its worker down. [`catch_panic`] runs a
//! future under `catch_unwind` and turns a panic into a [`PanicReport`]
//! carrying a readable message and the backtrace captured where the panic
//! was raised.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::FutureExt;

use keel_common::Error;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain a panic hook that records a backtrace for the panicking thread.
///
/// Idempotent; the previous hook still runs.
pub fn install_backtrace_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

/// A recovered panic
#[derive(Debug)]
pub struct PanicReport {
    /// Rendered panic payload
    pub message: String,
    /// Backtrace from the panic site, if the hook was installed
    pub backtrace: Option<String>,
}

impl PanicReport {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        Self {
            message: describe_payload(payload.as_ref()),
            backtrace: LAST_BACKTRACE
                .with(|slot| slot.borrow_mut().take())
                .map(|bt| bt.to_string()),
        }
    }

    /// Convert into a retryable error for the dispatch failure path
    pub fn into_error(self) -> Error {
        Error::internal_with_context("panic", self.message)
    }
}

/// Render a panic payload according to its type
pub fn describe_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = payload.downcast_ref::<Error>() {
        format!("error: {e}")
    } else if let Some(e) = payload.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
        format!("error: {e}")
    } else {
        "unknown panic".to_string()
    }
}

/// Await `future`, converting a panic into a [`PanicReport`]
pub async fn catch_panic<F: Future>(future: F) -> Result<F::Output, PanicReport> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(PanicReport::from_payload)
}
