use std::io::Write;

use anyhow::Result;
use clap::Parser;

use crate::fetch::{DEFAULT_LIMIT, Fetcher, Transport};

#[derive(Parser, Debug)]
#[command(name = "api-fetcher")]
#[command(about = "Simple script to fetch data from an API", long_about = None)]
pub struct Cli {
    /// The number of items to fetch from the API
    #[arg(short, long, default_value_t = DEFAULT_LIMIT)]
    pub limit: u32,
}

impl Cli {
    pub fn run<T: Transport>(self, transport: T, out: impl Write) -> Result<()> {
        tracing::info!(limit = self.limit, "requesting items");
        Fetcher::new(transport)?.run(self.limit, out)
    }
}
