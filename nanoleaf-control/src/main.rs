use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};

use nanoleaf_control_lib::control_interface::{
    CliColors, Color, Controller, State, DEFAULT_PORT, RGB,
};
use nanoleaf_control_lib::util::context::Context;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "nanoleaf_control",
    about = "Controls Nanoleaf light panels",
    version
)]
pub struct Cli {
    /// Sets the IP address or hostname of the Nanoleaf controller
    #[clap(long)]
    ip: String,

    /// Sets the auth token issued by the controller
    #[clap(long)]
    token: String,

    /// Port of the controller's HTTP API
    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Overall time limit for the request, retries included, in milliseconds
    #[clap(short = 't', long = "timeout", default_value_t = 10_000)]
    timeout: u64,

    /// Print trace lines for every request
    #[clap(long)]
    trace: bool,

    #[clap(subcommand)]
    action: DeviceAction,
}

/// Supported output formats for the `state` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Actions that can be sent to the device
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Gets the device name, firmware and effects.
    #[clap(name = "state")]
    State {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,
    },
    /// Turns the panels on.
    #[clap(name = "on")]
    On,
    /// Turns the panels off.
    #[clap(name = "off")]
    Off,
    /// Sets the brightness.
    #[clap(name = "brightness")]
    Brightness {
        /// Brightness (0-100)
        value: i32,

        /// Fade duration in milliseconds, sent to the device in whole seconds
        #[clap(long, value_parser = parse_duration)]
        duration: Option<Duration>,
    },
    /// Selects an effect stored on the device.
    #[clap(name = "effect")]
    Effect {
        /// Name of the effect, as listed by `state`
        name: String,
    },
    /// Shows a solid color.
    #[clap(name = "color")]
    Color {
        /// The color to display by name
        #[clap(value_enum)]
        color: Option<CliColors>,

        /// Hue of the color (0-360)
        #[clap(long)]
        hue: Option<i32>,

        /// Saturation of the color (0-100)
        #[clap(long)]
        sat: Option<i32>,

        /// Brightness of the color (0-100)
        #[clap(long)]
        brightness: Option<i32>,

        /// Red component of the color (0-255)
        #[clap(short = 'r', long = "red", value_parser = clap::value_parser!(u8))]
        red: Option<u8>,

        /// Green component of the color (0-255)
        #[clap(short = 'g', long = "green", value_parser = clap::value_parser!(u8))]
        green: Option<u8>,

        /// Blue component of the color (0-255)
        #[clap(short = 'b', long = "blue", value_parser = clap::value_parser!(u8))]
        blue: Option<u8>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, &'static str> {
    let millis = s
        .parse::<u64>()
        .map_err(|_| "could not parse duration in milliseconds")?;
    Ok(Duration::from_millis(millis))
}

fn print_state(state: &State, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Plaintext => {
            println!("Name: {}", state.name);
            println!("Serial: {}", state.serial);
            println!("Firmware: {}", state.firmware_version);
            println!("Selected effect: {}", state.effects.selected);
            println!("Effects:");
            for effect in &state.effects.list {
                println!("  {}", effect);
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string(state)?;
            println!("{}", json);
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(state)?;
            println!("{}", yaml);
        }
    }
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let mut controller = Controller::connect(&cli.ip, &cli.token)?.with_port(cli.port);
    if cli.trace {
        controller = controller.with_tracer(|_ctx: &Context, line: fmt::Arguments<'_>| {
            info!("{}", line);
        });
    }

    let ctx = Context::with_timeout(Duration::from_millis(cli.timeout));
    let canceller = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling request");
            canceller.cancel();
        }
    });

    match cli.action {
        DeviceAction::State { output } => {
            let state = controller.state(&ctx).await?;
            print_state(&state, output)?;
        }
        DeviceAction::On => {
            controller.on(&ctx).await?;
            println!("Panels turned on.");
        }
        DeviceAction::Off => {
            controller.off(&ctx).await?;
            println!("Panels turned off.");
        }
        DeviceAction::Brightness { value, duration } => {
            controller.set_brightness(&ctx, value, duration).await?;
            println!("Brightness set to {}", value);
        }
        DeviceAction::Effect { name } => {
            controller.set_effect(&ctx, &name).await?;
            println!("Effect set to {}", name);
        }
        DeviceAction::Color {
            color,
            hue,
            sat,
            brightness,
            red,
            green,
            blue,
        } => {
            let color_to_show = match (color, hue, sat, brightness, red, green, blue) {
                (Some(name), None, None, None, None, None, None) => Color::from(name),
                (None, Some(hue), Some(saturation), Some(brightness), None, None, None) => Color {
                    hue,
                    saturation,
                    brightness,
                },
                (None, None, None, None, Some(r), Some(g), Some(b)) => Color::from(RGB {
                    red: r,
                    green: g,
                    blue: b,
                }),
                _ => return Err(anyhow!("Invalid color specification")),
            };

            controller.set_color(&ctx, color_to_show).await?;
            println!("Displayed color: {:?}", color_to_show);
        }
    }

    Ok(())
}
