use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "subgate")]
#[command(author, version, about = "Telegram paid-group subscription bot", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the bot, the webhook server and the background sweeper
    Run {
        /// Do not start the background sweeper (another instance runs it)
        #[arg(long)]
        no_sweeper: bool,
    },

    /// Run one sweep now: renewals, expiries, revocations, stale intents
    Sweep,

    /// Run one reminder pass now
    Remind,

    /// Validate the environment configuration and exit
    CheckConfig,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["subgate", "run", "--no-sweeper"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Run { no_sweeper: true }));

        let cli = Cli::try_parse_from(["subgate", "check-config"]).unwrap();
        assert_eq!(cli.command, Some(Commands::CheckConfig));

        let cli = Cli::try_parse_from(["subgate"]).unwrap();
        assert_eq!(cli.command, None);
    }
}
