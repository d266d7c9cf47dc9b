//! # Nanoleaf Control Library
//!
//! `nanoleaf-control-lib` is a Rust library for controlling Nanoleaf light panels
//! through the HTTP API their controllers expose on the local network. It can
//! query the device state, switch the panels on and off, change brightness and
//! color, and select one of the effects stored on the device.
//!
//! Requests to a controller on the LAN are usually fast but regularly get
//! lost, so every request is retried with escalating per-attempt timeouts until
//! it succeeds, fails for a reason other than a timeout, or the caller's
//! [`Context`](util::context::Context) is cancelled or runs out of time.
//!
//! ## Example
//!
//! ```no_run
//! use nanoleaf_control_lib::control_interface::{Color, Controller};
//! use nanoleaf_control_lib::util::context::Context;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let controller = Controller::connect("192.168.1.100", "auth-token")?;
//!     // Give up on the whole request, retries included, after 10 seconds
//!     let ctx = Context::with_timeout(Duration::from_secs(10));
//!
//!     let state = controller.state(&ctx).await?;
//!     println!("{} is showing {}", state.name, state.effects.selected);
//!
//!     controller.on(&ctx).await?;
//!     controller
//!         .set_color(&ctx, Color { hue: 30, saturation: 80, brightness: 60 })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Nanoleaf or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

// The `control_interface` module provides the `Controller` used to talk to a
// single device: state queries, power, brightness, color and effects.
//
// Example usage:
//
// ```
// use nanoleaf_control_lib::control_interface::Controller;
// use nanoleaf_control_lib::util::context::Context;
//
// #[tokio::main]
// async fn main() {
//     let controller = Controller::connect("192.168.1.100", "auth-token").unwrap();
//     controller.set_effect(&Context::background(), "Northern Lights").await.unwrap();
// }
// ```
pub mod control_interface;

// The `util` module holds the request plumbing under the controller: the
// cancellation `Context`, the `Retrier` with its backoff schedule, and the
// `Tracer` hook.
pub mod util;
