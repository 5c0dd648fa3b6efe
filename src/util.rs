use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt, TransactionContext};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

/// Turn a panic payload into an error carrying the panic message, if any.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("handler panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("handler panicked: {message}")
    } else {
        anyhow!("handler panicked")
    }
}

/// Run `callback` inside a Sentry transaction named after the queue.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Arc::new(Hub::new_from_top(Hub::current()));
    let tx_ctx = TransactionContext::new(transaction_name, "dbworker.handle");
    let tx = sentry_core::start_transaction(tx_ctx);

    hub.configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = callback().bind_hub(hub).await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn panic_messages_are_preserved() {
        let payload = catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "handler panicked: static message"
        );

        let id = 7;
        let payload = catch_unwind(|| panic!("formatted {id}")).unwrap_err();
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "handler panicked: formatted 7"
        );

        let payload = catch_unwind(|| std::panic::panic_any(42_u8)).unwrap_err();
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "handler panicked");
    }

    #[tokio::test]
    async fn sentry_transaction_passes_results_through() {
        let ok: Result<u8, anyhow::Error> =
            with_sentry_transaction("test", || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<u8, anyhow::Error> =
            with_sentry_transaction("test", || async { Err(anyhow!("nope")) }).await;
        assert_eq!(err.unwrap_err().to_string(), "nope");
    }
}
