use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Error};
use clap::Parser;
use polyudp::stream::{UdpEncryptorApp, UdpFiles, files::sharded_paths};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::tcp_channel::TcpChannel;

mod tcp_channel;

/// Encrypts this party's rows for the peer and collects the peer's rows at this party's
/// indexes, ahead of the joint decryption.
#[derive(Debug, Parser)]
#[command(name = "polyudp-encryptor")]
struct Cli {
    /// 0 for the publisher, 1 for the partner.
    #[arg(long)]
    party: usize,
    /// The address of the publisher (the partner connects to it).
    #[arg(long, default_value = "127.0.0.1")]
    server_ip: std::net::IpAddr,
    /// The port of the publisher.
    #[arg(long, default_value_t = 5000)]
    port: u16,
    /// Data files are read from `<data_base_path>_0` to `<data_base_path>_<n-1>`.
    #[arg(long)]
    data_base_path: PathBuf,
    /// The number of data files.
    #[arg(long, default_value_t = 1)]
    data_num: usize,
    /// Index files are read from `<index_base_path>_0` to `<index_base_path>_<n-1>`.
    #[arg(long)]
    index_base_path: PathBuf,
    /// The number of index files.
    #[arg(long, default_value_t = 1)]
    index_num: usize,
    /// Encryption results are written to `<encryption_output_base_path>_0` and onwards.
    #[arg(long)]
    encryption_output_base_path: PathBuf,
    /// The number of shards to split the encryption results into.
    #[arg(long, default_value_t = 1)]
    encryption_output_num: usize,
    /// The JSON file with the row counts and widths of both parties.
    #[arg(long)]
    global_parameters_file: PathBuf,
    /// Where to write the key of this party's rows.
    #[arg(long)]
    expanded_key_file: PathBuf,
    /// The number of rows encrypted and sent at once.
    #[arg(long, default_value_t = 50000)]
    chunk_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    let files = UdpFiles {
        index_files: sharded_paths(&cli.index_base_path, cli.index_num),
        data_files: sharded_paths(&cli.data_base_path, cli.data_num),
        global_parameters: cli.global_parameters_file,
        encryption_files: sharded_paths(&cli.encryption_output_base_path, cli.encryption_output_num),
        expanded_key_file: cli.expanded_key_file,
    };

    let addr = SocketAddr::new(cli.server_ip, cli.port);
    let channel = Arc::new(TcpChannel::connect(cli.party, addr).await?);
    let am_i_publisher = cli.party == 0;
    info!(party = cli.party, "Connected, starting the encryption");
    UdpEncryptorApp::new(channel, 1 - cli.party, am_i_publisher, cli.chunk_size)
        .invoke(&files)
        .await
        .context("Encryption failed")?;
    info!("Done");
    Ok(())
}
