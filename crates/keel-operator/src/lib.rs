//! Keel operator engine: work queue, event ingestion and the dispatch loop
//!
//! A binary builds an [`Operator`] from an [`OperatorConfig`], registers its
//! handlers and informers, and calls [`Operator::start`]:
//!
//! ```ignore
//! let telemetry = config.init_telemetry()?;
//! let operator = Arc::new(Operator::new(config)?);
//! operator.register_informer(Arc::new(KubeInformer::new(Api::<Route>::all(client.clone()))))?;
//! operator.register_handler(Arc::new(RouteHandler::new(client)))?;
//! operator.start(shutdown).await?;
//! telemetry.shutdown();
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod handler;
pub mod informer;
pub mod operator;
pub mod panic;
pub mod queue;

pub use config::{OperatorConfig, TelemetryArgs};
pub use handler::{Handler, KindHandler, Starter};
pub use informer::{ChannelInformer, Informer, KubeInformer, ResourceEventHandler, ResourceKind};
pub use operator::{Dispatch, Operator};
pub use queue::WorkQueue;
