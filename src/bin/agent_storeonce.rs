//! Special agent for HP StoreOnce backup appliances.

use anyhow::Result;
use clap::Parser;

use awsagent::storeonce::{
    parse_properties, write_section, StoreOnceClient, StoreOnceConfig, CLUSTER_PATH,
    SERVICESETS_PATH,
};

#[derive(Debug, Parser)]
#[command(name = "agent-storeonce", version, about)]
struct Args {
    /// Appliance address (host or host:port).
    #[arg(long)]
    address: String,

    /// Appliance user.
    #[arg(long)]
    user: String,

    /// Appliance password.
    #[arg(long)]
    password: String,

    /// Skip TLS certificate verification (self-signed appliance certs).
    #[arg(long)]
    no_cert_check: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let client = StoreOnceClient::new(StoreOnceConfig {
        address: args.address,
        user: args.user,
        password: args.password,
        verify_tls: !args.no_cert_check,
    })?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let cluster = parse_properties(&client.fetch_xml(CLUSTER_PATH)?)?;
    write_section(&mut out, "clusterinfo", &cluster)?;

    let servicesets = parse_properties(&client.fetch_xml(SERVICESETS_PATH)?)?;
    write_section(&mut out, "servicesets", &servicesets)?;

    Ok(())
}
