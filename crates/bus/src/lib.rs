//! In-process publish/subscribe.
//!
//! Producers [`publish`](EventBus::publish) events onto a FIFO queue; a
//! periodic [`tick`](EventBus::tick) drains the queue and fans each event out
//! to every matching subscription, highest priority first. Failing handlers
//! are retried with exponential backoff on a clock-driven schedule, guarded by
//! a per-handler circuit breaker, and finally dead-lettered.

pub mod breaker;
pub mod bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod pattern;
pub mod scheduler;
pub mod schema;
pub mod stats;

pub use breaker::{BreakerOptions, HandlerBreaker};
pub use bus::{DeadLetterEvent, EventBus, HandlerInfo, Subscription, TickReport};
pub use config::BusConfig;
pub use error::{BusError, HandlerError};
pub use handler::{EventHandler, RetryOptions, SubscribeOptions, handler_fn};
pub use pattern::EventPattern;
pub use schema::EventSchema;
pub use stats::{BusHealth, BusStatsSnapshot, HealthStatus};
