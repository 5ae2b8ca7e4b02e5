//! Process-wide audit trail of every execution, logged through tracing

use tether_query::{EventBus, ExecutionEvent, SubscriptionId};
use tracing::{debug, error, info, warn};

fn describe(event: &ExecutionEvent) -> String {
    let token = event.token();
    match token.label() {
        Some(label) => format!("{} ({})", label, token.id()),
        None => format!("{} ({})", token.operation(), token.id()),
    }
}

fn elapsed_ms(event: &ExecutionEvent) -> i64 {
    event
        .duration()
        .map(|d| d.num_milliseconds())
        .unwrap_or_default()
}

/// Subscribe the audit listeners to `bus`
pub fn install(bus: &EventBus) -> Vec<SubscriptionId> {
    vec![
        bus.on_started(|event| {
            debug!(
                "[{}] started {}: {}",
                event.source_name(),
                describe(event),
                event.token().operation()
            );
            Ok(())
        }),
        bus.on_finished(|event| {
            info!(
                "[{}] finished {} in {}ms, rows affected: {}",
                event.source_name(),
                describe(event),
                elapsed_ms(event),
                event
                    .rows_affected()
                    .map(|rows| rows.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            Ok(())
        }),
        bus.on_canceled(|event| {
            warn!(
                "[{}] canceled {} after {}ms",
                event.source_name(),
                describe(event),
                elapsed_ms(event)
            );
            Ok(())
        }),
        bus.on_error(|event| {
            error!(
                "[{}] {} failed after {}ms: {}",
                event.source_name(),
                describe(event),
                elapsed_ms(event),
                event
                    .error()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            );
            Ok(())
        }),
    ]
}
