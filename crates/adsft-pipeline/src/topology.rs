//! Broker topology and the TaskMaster that declares it
//!
//! Queue names and routing keys are part of the operational contract:
//! monitoring and integration tests address queues by these exact names.

use adsft_common::{PipelineError, Result};
use tracing::{debug, info};

use crate::broker::{Channel, ExchangeKind};

/// Ingress exchange every stage publishes to
pub const EXCHANGE: &str = "FulltextExtractionExchange";

pub const CHECK_ROUTING_KEY: &str = "check";
pub const STANDARD_ROUTING_KEY: &str = "extract.standard";
pub const PDF_ROUTING_KEY: &str = "extract.pdf";
pub const RESULT_ROUTING_KEY: &str = "result";
pub const ERROR_ROUTING_KEY: &str = "error";

pub const CHECK_QUEUE: &str = "CheckIfExtractQueue";
pub const STANDARD_QUEUE: &str = "StandardFileExtractorQueue";
pub const PDF_QUEUE: &str = "PDFFileExtractorQueue";
pub const RESULT_QUEUE: &str = "FulltextResultQueue";
pub const ERROR_QUEUE: &str = "ErrorHandlerQueue";

/// One `{exchange, queue, routing_key}` binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// The pipeline's static route table, in declaration order
pub fn default_routes(exchange: &str) -> Vec<Route> {
    vec![
        Route::new(exchange, CHECK_QUEUE, CHECK_ROUTING_KEY),
        Route::new(exchange, STANDARD_QUEUE, STANDARD_ROUTING_KEY),
        Route::new(exchange, PDF_QUEUE, PDF_ROUTING_KEY),
        Route::new(exchange, RESULT_QUEUE, RESULT_ROUTING_KEY),
        Route::new(exchange, ERROR_QUEUE, ERROR_ROUTING_KEY),
    ]
}

/// Declares exchanges, queues and bindings at startup.
///
/// Holds no per-task state; once [`TaskMaster::initialize`] returns the
/// broker carries the wiring.
#[derive(Debug, Clone)]
pub struct TaskMaster {
    routes: Vec<Route>,
    exchange_kind: ExchangeKind,
}

impl TaskMaster {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes,
            exchange_kind: ExchangeKind::Topic,
        }
    }

    /// TaskMaster for the default route table on `exchange`
    pub fn with_default_routes(exchange: &str) -> Self {
        Self::new(default_routes(exchange))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Queue fed by a routing key, if the table has one
    pub fn queue_for(&self, routing_key: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| r.routing_key == routing_key)
            .map(|r| r.queue.as_str())
    }

    /// Declare every exchange, queue and binding in the route table.
    ///
    /// Safe to run against an already-configured broker: declarations of
    /// existing objects succeed and bindings are not duplicated. Any failure
    /// is a [`PipelineError::Topology`] and must stop the process.
    pub async fn initialize<C: Channel + ?Sized>(&self, channel: &C) -> Result<()> {
        let mut declared_exchanges: Vec<&str> = Vec::new();

        for route in &self.routes {
            if !declared_exchanges.contains(&route.exchange.as_str()) {
                channel
                    .declare_exchange(&route.exchange, self.exchange_kind)
                    .await
                    .map_err(|e| topology_error("declare exchange", &route.exchange, e))?;
                declared_exchanges.push(&route.exchange);
                debug!(exchange = %route.exchange, kind = %self.exchange_kind, "Declared exchange");
            }

            channel
                .declare_queue(&route.queue)
                .await
                .map_err(|e| topology_error("declare queue", &route.queue, e))?;

            channel
                .bind_queue(&route.queue, &route.exchange, &route.routing_key)
                .await
                .map_err(|e| topology_error("bind queue", &route.queue, e))?;

            debug!(
                exchange = %route.exchange,
                queue = %route.queue,
                routing_key = %route.routing_key,
                "Bound queue"
            );
        }

        info!(routes = self.routes.len(), "Broker topology initialized");
        Ok(())
    }
}

fn topology_error(action: &str, name: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Topology(format!("failed to {} '{}': {}", action, name, err))
}
