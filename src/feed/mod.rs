//! Feed source abstraction (§4.D): a single capability interface behind
//! which the SSE and GTFS-RT transports are interchangeable to the
//! orchestrator.

pub mod dedup;
pub mod gtfs_rt;
pub mod sse;

use async_trait::async_trait;

use crate::model::VehicleUpdate;

/// A stream of vehicle updates. `None` signals the source has given up on
/// this poll/connection attempt (the caller reconnects); it never signals
/// permanent exhaustion.
#[async_trait]
pub trait FeedSource: Send {
    async fn next_update(&mut self) -> Option<VehicleUpdate>;
}
