//! Demonstration procedures exposed by the `tunnelgate` binary.
//!
//! | Method        | Kind          | Result                                  |
//! |---------------|---------------|-----------------------------------------|
//! | `echo.ping`   | call          | echoes `params`                         |
//! | `system.info` | call          | name, version, os, arch                 |
//! | `clock.ticks` | shared stream | `{tick, at_ms}` every `intervalMs` (1s) |
//!
//! `clock.ticks` is keyed by `params.streamId`; an optional `count` ends the
//! stream after that many ticks.

use std::env::consts::{ARCH, OS};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::Stream;
use serde_json::{json, Value};

use crate::error::RouterError;
use crate::router::CommandRouter;

const DEFAULT_TICK_MS: u64 = 1000;
const MIN_TICK_MS: u64 = 10;

pub fn router() -> Result<CommandRouter, RouterError> {
    CommandRouter::builder()
        .call("echo.ping", |params| async move { Ok(params) })
        .call("system.info", |_| async {
            Ok(json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "os": OS,
                "arch": ARCH,
            }))
        })
        .shared_stream("clock.ticks", "streamId", ticks)
        .build()
}

fn ticks(params: Value) -> impl Stream<Item = Result<Value, String>> {
    let limit = params.get("count").and_then(Value::as_u64);
    let period = Duration::from_millis(
        params
            .get("intervalMs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TICK_MS)
            .max(MIN_TICK_MS),
    );
    let interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    futures::stream::unfold((interval, 0u64), move |(mut interval, n)| async move {
        if limit.is_some_and(|l| n >= l) {
            return None;
        }
        interval.tick().await;
        Some((Ok(json!({ "tick": n, "at_ms": unix_ms() })), (interval, n + 1)))
    })
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn echo_and_info() {
        let router = router().unwrap();
        let echoed = router.invoke("echo.ping", json!({"a": 1})).await.unwrap();
        assert_eq!(echoed, json!({"a": 1}));
        let info = router.invoke("system.info", json!({})).await.unwrap();
        assert_eq!(info["os"], OS);
    }

    #[tokio::test]
    async fn ticks_honour_count() {
        let router = router().unwrap();
        let stream = router
            .open_stream("clock.ticks", json!({"streamId": "c", "count": 2, "intervalMs": 10}))
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_ref().unwrap()["tick"], 1);
    }
}
