//! Per-message processing.
//!
//! Decodes the envelope, dispatches to the domain handler inside a panic
//! boundary and picks exactly one terminal action. Failures never requeue:
//! a poison message is not redelivered by the broker.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, info, warn, Instrument};

use super::{EventHandler, HandlerError, InboundMessage, Settlement};
use crate::event::Envelope;

const NACK: Settlement = Settlement::Nack { requeue: false };
const REJECT: Settlement = Settlement::Reject { requeue: false };

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records the backtrace on the panicking thread.
///
/// The stack is already unwound once the guard sees the panic, so the trace
/// has to be taken inside the hook to show the faulting frame.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANIC_BACKTRACE.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(Backtrace::force_capture());
                }
            });
            previous(info);
        }));
    });
}

fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
        .ok()
        .flatten()
}

enum Dispatch {
    Handled,
    Unknown,
    Undecodable(serde_json::Error),
    Failed(HandlerError),
}

/// Decide the terminal action for one message body.
///
/// The handler runs at most once, and only for a well-formed envelope with a
/// non-empty payload and a type the handler recognises.
pub async fn process_message<H>(handler: &H, body: &[u8]) -> Settlement
where
    H: EventHandler + ?Sized,
{
    let started = Instant::now();

    let envelope = match Envelope::decode(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(
                elapsed_ms = elapsed_ms(started),
                error = %e,
                body = %String::from_utf8_lossy(body),
                "Failed to decode event envelope"
            );
            return NACK;
        }
    };

    if !envelope.has_payload() {
        error!(
            elapsed_ms = elapsed_ms(started),
            kind = %envelope.kind,
            "Received event without payload"
        );
        return NACK;
    }

    install_panic_hook();
    let guarded = AssertUnwindSafe(dispatch(handler, &envelope))
        .catch_unwind()
        .await;

    match guarded {
        Ok(Dispatch::Handled) => {
            info!(
                elapsed_ms = elapsed_ms(started),
                kind = %envelope.kind,
                "Event handled"
            );
            Settlement::Ack
        }
        Ok(Dispatch::Unknown) => {
            warn!(kind = %envelope.kind, "Rejecting event of unknown type");
            REJECT
        }
        Ok(Dispatch::Undecodable(e)) => {
            error!(
                elapsed_ms = elapsed_ms(started),
                kind = %envelope.kind,
                error = %e,
                "Failed to decode event payload"
            );
            NACK
        }
        Ok(Dispatch::Failed(e)) => {
            error!(
                elapsed_ms = elapsed_ms(started),
                kind = %envelope.kind,
                error = %e,
                "Event handler failed"
            );
            NACK
        }
        Err(panic) => {
            let backtrace = take_panic_backtrace()
                .map(|backtrace| backtrace.to_string())
                .unwrap_or_else(|| "unavailable".to_string());
            error!(
                elapsed_ms = elapsed_ms(started),
                kind = %envelope.kind,
                panic = %panic_message(panic.as_ref()),
                backtrace = %backtrace,
                "Recovered from panic while handling event"
            );
            NACK
        }
    }
}

/// Process one delivery and settle it. Settlement failures are logged only.
pub async fn handle_delivery<H>(handler: &H, message: InboundMessage)
where
    H: EventHandler + ?Sized,
{
    let span = tracing::info_span!("broker.consume", routing_key = %message.routing_key());

    async {
        debug!(content_type = ?message.content_type(), "Received message");
        let settlement = process_message(handler, message.body()).await;
        if let Err(e) = message.settle(settlement).await {
            error!(error = %e, ?settlement, "Failed to settle message");
        }
    }
    .instrument(span)
    .await;
}

async fn dispatch<H>(handler: &H, envelope: &Envelope) -> Dispatch
where
    H: EventHandler + ?Sized,
{
    let event = match handler.decode(&envelope.kind, &envelope.payload) {
        Ok(Some(event)) => event,
        Ok(None) => return Dispatch::Unknown,
        Err(e) => return Dispatch::Undecodable(e),
    };

    match handler.dispatch(event).await {
        Ok(()) => Dispatch::Handled,
        Err(e) => Dispatch::Failed(e),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
