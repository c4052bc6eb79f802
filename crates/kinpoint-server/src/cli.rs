use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "kinpoint-server",
    about = "Real-time family coordination gateway"
)]
pub struct Args {
    /// Bind address, overrides HOST.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listen port, overrides PORT.
    #[arg(long)]
    pub port: Option<u16>,
}
