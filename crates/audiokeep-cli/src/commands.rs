//! Subcommand definitions.

use clap::{Args, Subcommand};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run both context sources on the simulated gesture-gated platform
    Simulate(SimulateArgs),

    /// Run both context sources on the native host platform
    Host {
        /// How long to run, in seconds
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

/// Timeline of a simulation. All times are seconds from the start.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct SimulateArgs {
    /// How long to run
    #[arg(long, default_value_t = 20.0)]
    pub seconds: f64,

    /// Deliver a click every S seconds (no gestures when omitted)
    #[arg(long, value_name = "S")]
    pub gesture_every: Option<f64>,

    /// Mark both live contexts broken
    #[arg(long, value_name = "S")]
    pub break_at: Option<f64>,

    /// Put the device to sleep and wake it again
    #[arg(long, value_name = "S")]
    pub sleep_at: Option<f64>,

    /// Move the host into the background, idle
    #[arg(long, value_name = "S")]
    pub background_at: Option<f64>,

    /// Bring the host back to the foreground
    #[arg(long, value_name = "S")]
    pub foreground_at: Option<f64>,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::Cli;

    #[test]
    fn simulate_timeline_flags() {
        let cli = Cli::parse_from([
            "audiokeep",
            "simulate",
            "--seconds",
            "5",
            "--gesture-every",
            "1.5",
            "--sleep-at",
            "3",
        ]);
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert!((args.seconds - 5.0).abs() < f64::EPSILON);
        assert_eq!(args.gesture_every, Some(1.5));
        assert_eq!(args.sleep_at, Some(3.0));
        assert_eq!(args.break_at, None);
        assert!(!args.json);
    }

    #[test]
    fn host_defaults() {
        let cli = Cli::parse_from(["audiokeep", "host"]);
        assert!(matches!(cli.command, Commands::Host { json: false, .. }));
    }
}
