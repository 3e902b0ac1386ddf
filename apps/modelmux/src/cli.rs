use clap::Parser;

#[derive(Parser)]
#[command(name = "modelmux", about = "Multi-provider LLM reverse proxy")]
pub(crate) struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "modelmux.yaml")]
    pub(crate) config: String,
    /// Overrides the config file's listen host.
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Overrides the config file's listen port.
    #[arg(long)]
    pub(crate) port: Option<u16>,
}
