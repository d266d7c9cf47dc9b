use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use clap::ValueEnum;
use derivative::Derivative;
use log::{debug, trace};
use palette::{FromColor, Hsv, Srgb};
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::context::Context;
use crate::util::retry::{Backoff, Retrier};
use crate::util::traits::Tracer;

/// Port of the local control API.
pub const DEFAULT_PORT: u16 = 16021;

/// Stands in for the auth token in anything that gets logged or traced.
const REDACTED_TOKEN: &str = "<tok>";

/// The device answered with a status of 300 or above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("HTTP response {status}")]
pub struct UnexpectedStatus {
    pub status: StatusCode,
}

/// A client for one Nanoleaf controller.
///
/// Cloning is cheap and clones can be used concurrently; every call is an
/// independent request.
#[derive(Derivative, Clone)]
#[derivative(Debug, PartialEq)]
pub struct Controller {
    host: String,
    port: u16,
    #[derivative(Debug = "ignore")]
    auth_token: String,
    backoff: Backoff,
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    client: Client,
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    tracer: Option<Arc<dyn Tracer>>,
}

/// State of the controller, as reported by `GET /`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    /// The native name, not what you've given it.
    pub name: String,
    #[serde(rename = "serialNo")]
    pub serial: String,
    #[serde(rename = "firmwareVersion")]
    pub firmware_version: String,
    pub effects: Effects,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Effects {
    #[serde(rename = "select")]
    pub selected: String,
    #[serde(rename = "effectsList")]
    pub list: Vec<String>,
}

/// A color in the device's own terms.
///
/// Values are sent as they are; the device decides what to do with values
/// out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    /// Range inside 0..=360.
    pub hue: i32,
    /// Range inside 0..=100.
    pub saturation: i32,
    /// Range inside 0..=100.
    pub brightness: i32,
}

impl From<RGB> for Color {
    fn from(rgb: RGB) -> Self {
        let srgb = Srgb::new(rgb.red, rgb.green, rgb.blue).into_format::<f32>();
        let hsv: Hsv = Hsv::from_color(srgb);
        Color {
            hue: hsv.hue.into_positive_degrees().round() as i32,
            saturation: (hsv.saturation * 100.0).round() as i32,
            brightness: (hsv.value * 100.0).round() as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RGB {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl From<(u8, u8, u8)> for RGB {
    fn from((red, green, blue): (u8, u8, u8)) -> Self {
        RGB { red, green, blue }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliColors {
    Red,
    Green,
    Blue,
    Yellow,
    Orange,
    Purple,
    Cyan,
    Magenta,
    Pink,
    Teal,
    White,
}

impl FromStr for CliColors {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <CliColors as ValueEnum>::from_str(s, true).map_err(|_| anyhow!("Invalid color"))
    }
}

impl From<CliColors> for RGB {
    fn from(color: CliColors) -> Self {
        let rgb = match color {
            CliColors::Red => (255, 0, 0),
            CliColors::Green => (0, 255, 0),
            CliColors::Blue => (0, 0, 255),
            CliColors::Yellow => (255, 255, 0),
            CliColors::Orange => (255, 165, 0),
            CliColors::Purple => (128, 0, 128),
            CliColors::Cyan => (0, 255, 255),
            CliColors::Magenta => (255, 0, 255),
            CliColors::Pink => (255, 192, 203),
            CliColors::Teal => (0, 128, 128),
            CliColors::White => (255, 255, 255),
        };
        rgb.into()
    }
}

impl From<CliColors> for Color {
    fn from(color: CliColors) -> Self {
        RGB::from(color).into()
    }
}

#[derive(Serialize, Debug)]
struct Value<T> {
    value: T,
}

#[derive(Serialize, Debug)]
struct PowerRequest {
    on: Value<bool>,
}

#[derive(Serialize, Debug)]
struct BrightnessRequest {
    brightness: BrightnessValue,
}

#[derive(Serialize, Debug)]
struct BrightnessValue {
    value: i32,
    /// Whole seconds, left out when zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u64>,
}

impl BrightnessValue {
    fn new(value: i32, duration: Option<Duration>) -> Self {
        BrightnessValue {
            value,
            duration: duration.map(|d| d.as_secs()).filter(|&secs| secs > 0),
        }
    }
}

#[derive(Serialize, Debug)]
struct EffectRequest<'a> {
    select: &'a str,
}

#[derive(Serialize, Debug)]
struct ColorRequest {
    hue: Value<i32>,
    sat: Value<i32>,
    brightness: Value<i32>,
}

impl From<Color> for ColorRequest {
    fn from(color: Color) -> Self {
        ColorRequest {
            hue: Value { value: color.hue },
            sat: Value {
                value: color.saturation,
            },
            brightness: Value {
                value: color.brightness,
            },
        }
    }
}

impl Controller {
    /// Creates a controller for the device at `host`.
    ///
    /// Nothing is sent to the device; an unreachable host or a bad token only
    /// shows up on the first request.
    pub fn connect(host: &str, auth_token: &str) -> anyhow::Result<Self> {
        // No idle connections: every attempt dials a fresh one.
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Controller {
            host: host.to_string(),
            port: DEFAULT_PORT,
            auth_token: auth_token.to_string(),
            backoff: Backoff::default(),
            client,
            tracer: None,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Attaches a tracer that is told when each operation starts and finishes.
    pub fn with_tracer<T: Tracer + 'static>(mut self, tracer: T) -> Self {
        self.tracer = Some(Arc::new(tracer));
        self
    }

    /// Requests the state of the controller.
    pub async fn state(&self, ctx: &Context) -> anyhow::Result<State> {
        self.get(ctx, "/").await
    }

    /// Turns the controller off.
    pub async fn off(&self, ctx: &Context) -> anyhow::Result<()> {
        self.put(
            ctx,
            "/state",
            &PowerRequest {
                on: Value { value: false },
            },
        )
        .await
    }

    /// Turns the controller on.
    pub async fn on(&self, ctx: &Context) -> anyhow::Result<()> {
        self.put(
            ctx,
            "/state",
            &PowerRequest {
                on: Value { value: true },
            },
        )
        .await
    }

    /// Sets the brightness, optionally fading over `duration`.
    ///
    /// # Arguments
    /// - `value`: The brightness value to set.
    ///            Range is 0..100.
    /// - `duration`: Fade time, sent in whole seconds. `None` changes immediately.
    pub async fn set_brightness(
        &self,
        ctx: &Context,
        value: i32,
        duration: Option<Duration>,
    ) -> anyhow::Result<()> {
        let request = BrightnessRequest {
            brightness: BrightnessValue::new(value, duration),
        };
        self.put(ctx, "/state", &request).await
    }

    /// Selects one of the effects stored on the device, by name.
    pub async fn set_effect(&self, ctx: &Context, effect: &str) -> anyhow::Result<()> {
        self.put(ctx, "/effects", &EffectRequest { select: effect })
            .await
    }

    pub async fn set_color(&self, ctx: &Context, color: Color) -> anyhow::Result<()> {
        self.put(ctx, "/state", &ColorRequest::from(color)).await
    }

    fn api(&self, token: &str, path: &str) -> String {
        format!("http://{}:{}/api/v1/{}{}", self.host, self.port, token, path)
    }

    fn retrier(&self) -> Retrier {
        Retrier::new(self.backoff).with_tracer(self.tracer.clone())
    }

    fn tracef(&self, ctx: &Context, line: fmt::Arguments<'_>) {
        if let Some(tracer) = &self.tracer {
            tracer.trace(ctx, line);
        }
    }

    async fn get<T: DeserializeOwned>(&self, ctx: &Context, path: &str) -> anyhow::Result<T> {
        let response = self.round_trip(ctx, Method::GET, path, None).await?;
        let status = response.status();
        let body = read_body(ctx, response).await;
        if let Ok(body) = &body {
            trace!("  {}\n  {}", status, String::from_utf8_lossy(body));
        }
        check_status(status)?;
        let body = body.context("reading HTTP response body")?;
        serde_json::from_slice(&body).context("decoding JSON response")
    }

    async fn put<B: Serialize>(&self, ctx: &Context, path: &str, obj: &B) -> anyhow::Result<()> {
        let body = serde_json::to_vec(obj).context("encoding JSON body")?;
        trace!("  {}", String::from_utf8_lossy(&body));
        let response = self.round_trip(ctx, Method::PUT, path, Some(body)).await?;
        let status = response.status();
        trace!("  {}", status);
        match read_body(ctx, response).await {
            Ok(body) if status != StatusCode::NO_CONTENT => {
                trace!("  {}", String::from_utf8_lossy(&body));
            }
            Ok(_) => {}
            Err(err) => {
                debug!("Discarding unreadable response body: {:#}", err);
            }
        }
        check_status(status)
    }

    async fn round_trip(
        &self,
        ctx: &Context,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<Response> {
        let redacted = self.api(REDACTED_TOKEN, path);
        self.tracef(ctx, format_args!("Nanoleaf {} to {}", method, redacted));
        debug!("{} to {}", method, redacted);

        let url = self.api(&self.auth_token, path);
        let retrier = self.retrier();
        retrier
            .run(ctx, |_sub| self.send(method.clone(), &url, body.as_deref()))
            .await
    }

    /// One attempt at the exchange, up to the response headers.
    ///
    /// No transport timeout is set: the retrier drops the attempt at its
    /// sub-deadline, and the body is read afterwards under the caller's context.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
    ) -> anyhow::Result<Response> {
        // If we need to retry, use a fresh connection.
        let mut request = self.client.request(method, url).header(CONNECTION, "close");
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }
        let request = request.build().context("preparing HTTP request")?;
        self.client
            .execute(request)
            .await
            .context("making HTTP request")
    }
}

async fn read_body(ctx: &Context, response: Response) -> anyhow::Result<Vec<u8>> {
    let body = ctx.run(response.bytes()).await??;
    Ok(body.to_vec())
}

fn check_status(status: StatusCode) -> anyhow::Result<()> {
    if status.as_u16() >= 300 {
        return Err(UnexpectedStatus { status }.into());
    }
    Ok(())
}
