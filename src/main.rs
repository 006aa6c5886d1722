use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bt_fetch::{
    client::{handshake, Client},
    config::{parse_peer_id, Config, DEFAULT_PORT},
    download::{download_piece, fetch_file},
    metainfo::Metainfo,
    parse::parse,
    piece::receiver,
    to_hex,
    tracker::announce,
    Error, Result,
};
use clap::{ArgAction, Parser, Subcommand};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// 20 byte peer id announced to tracker and peers
    #[arg(long, global = true, value_parser = parse_peer_id)]
    peer_id: Option<[u8; 20]>,

    /// Listening port announced to the tracker
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Request the compact peer list from the tracker
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set)]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a bencoded value and print it
    Decode { value: String },
    /// Print the contents of a metainfo (`.torrent`) file
    Info { metainfo: PathBuf },
    /// Print the peers the tracker reports
    Peers { metainfo: PathBuf },
    /// Handshake with a peer and print its peer id
    Handshake { metainfo: PathBuf, peer: SocketAddr },
    /// Download a single piece
    #[command(name = "download_piece")]
    DownloadPiece {
        /// Path to save downloaded piece
        #[arg(short, long)]
        output: PathBuf,
        metainfo: PathBuf,
        index: u32,
        /// Peer to download from instead of the tracker's first peer
        #[arg(long)]
        peer: Option<SocketAddr>,
    },
    /// Download the whole file
    Download {
        /// Path to save downloaded file
        #[arg(short, long)]
        output: PathBuf,
        metainfo: PathBuf,
        /// Peer to download from instead of the tracker's first peer
        #[arg(long)]
        peer: Option<SocketAddr>,
    },
}

impl Cli {
    fn config(&self) -> Config {
        let default = Config::default();
        Config {
            peer_id: self.peer_id.unwrap_or(default.peer_id),
            port: self.port,
            compact: self.compact,
            ..default
        }
    }
}

async fn load_metainfo(path: &Path) -> Result<Metainfo> {
    let bytes = tokio::fs::read(path).await?;
    Metainfo::load(&bytes)
}

/// Connect to the given peer, or the first one the tracker reports
async fn connect(
    metainfo: &Metainfo,
    config: &Config,
    peer: Option<SocketAddr>,
) -> Result<BufReader<TcpStream>> {
    let addr = match peer {
        Some(addr) => addr,
        None => announce(metainfo, config)
            .await?
            .first()
            .map(|peer| peer.addr())
            .ok_or_else(|| Error::Tracker("tracker returned no peers".to_string()))?,
    };
    info!("Connecting to peer {}", addr);
    Ok(BufReader::new(TcpStream::connect(addr).await?))
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config();
    match cli.command {
        Command::Decode { value } => {
            println!("{}", parse(value.as_bytes())?);
        }
        Command::Info { metainfo } => {
            let metainfo = load_metainfo(&metainfo).await?;
            println!("Tracker URL: {}", metainfo.announce);
            println!("Length: {}", metainfo.info.length);
            println!("Info Hash: {}", to_hex(&metainfo.info_hash));
            println!("Piece Length: {}", metainfo.info.piece_length);
            println!("Piece Hashes:");
            for hash in &metainfo.info.pieces {
                println!("{}", to_hex(hash));
            }
        }
        Command::Peers { metainfo } => {
            let metainfo = load_metainfo(&metainfo).await?;
            for peer in announce(&metainfo, &config).await? {
                println!("{}", peer);
            }
        }
        Command::Handshake { metainfo, peer } => {
            let metainfo = load_metainfo(&metainfo).await?;
            let mut socket = BufReader::new(TcpStream::connect(peer).await?);
            let response = handshake(&mut socket, metainfo.info_hash, &config).await?;
            println!("Peer ID: {}", to_hex(&response.peer_id));
        }
        Command::DownloadPiece {
            output,
            metainfo,
            index,
            peer,
        } => {
            let metainfo = load_metainfo(&metainfo).await?;
            let socket = connect(&metainfo, &config, peer).await?;
            let mut client = Client::new(socket, metainfo.info_hash, &config).await?;
            let piece = download_piece(&mut client, &metainfo, index).await?;
            let mut out_file = tokio::fs::File::create(&output).await?;
            out_file.write_all(&piece).await?;
            out_file.flush().await?;
            println!("Piece {} downloaded to {}.", index, output.display());
        }
        Command::Download {
            output,
            metainfo,
            peer,
        } => {
            let metainfo = load_metainfo(&metainfo).await?;
            let socket = connect(&metainfo, &config, peer).await?;
            let mut client = Client::new(socket, metainfo.info_hash, &config).await?;
            let mut out_file = tokio::fs::File::create(&output).await?;
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            let (fetched, written) = tokio::join!(
                fetch_file(&mut client, &metainfo, tx),
                receiver(&mut out_file, rx)
            );
            fetched?;
            let written = written?;
            println!("Downloaded {} bytes to {}.", written, output.display());
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
