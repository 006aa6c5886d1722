use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::parse::{BencodeDict, BencodeType};

const FAILURE_KEY: &str = "failure reason";
const INTERVAL_KEY: &str = "interval";
const PEERS_KEY: &str = "peers";
const PEERS6_KEY: &str = "peers6";
const COMPACT_PEER_LEN: usize = 6;
const COMPACT_PEER6_LEN: usize = 18;

/// Percent-encode every byte, treating the input as opaque binary
fn percent_encode_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("%{:02x}", byte))
        .collect::<Vec<String>>()
        .join("")
}

/// GET request to tracker
#[derive(Debug)]
pub struct Request {
    /// URL to make GET request to tracker
    pub url: Url,
}

impl Request {
    /// Create request
    pub fn new(tracker_url: &str, info_hash: &[u8], left: u64, config: &Config) -> Result<Request> {
        let mut url = Url::parse(tracker_url).map_err(|e| {
            Error::InvalidMetadata(format!("invalid announce URL {}: {}", tracker_url, e))
        })?;
        let binary_params = format!(
            "info_hash={}&peer_id={}",
            percent_encode_bytes(info_hash),
            percent_encode_bytes(&config.peer_id)
        );
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, binary_params),
            _ => binary_params,
        };
        url.set_query(Some(&query));
        url.query_pairs_mut()
            .append_pair("port", &config.port.to_string())
            .append_pair("uploaded", &0.to_string())
            .append_pair("downloaded", &0.to_string())
            .append_pair("left", &left.to_string())
            .append_pair("compact", &u8::from(config.compact).to_string());
        Ok(Request { url })
    }

    /// Send request and return response body
    pub async fn send(self) -> Result<Vec<u8>> {
        let response = reqwest::get(self.url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Tracker(format!(
                "tracker responded with HTTP status {}",
                status
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Response from tracker
#[derive(Debug, PartialEq)]
pub enum Response {
    /// Failed query
    Failure(String),
    /// Successful query
    Success {
        /// Interval (in seconds) at which to reconnect to tracker to refresh peer list
        interval: Option<u64>,
        /// Peers of file reported by tracker
        peers: Vec<Peer>,
    },
}

impl Response {
    /// Deserialise response message body
    ///
    /// Bytes following the top-level dict are ignored.
    pub fn deserialise(data: &[u8]) -> Result<Response> {
        let (value, end) = crate::parse::decode(data, 0)?;
        if end != data.len() {
            debug!("Ignoring {} trailing bytes in tracker response", data.len() - end);
        }
        let map = value
            .as_dict()
            .ok_or_else(|| Error::Tracker("response is not a dict".to_string()))?;

        if let Some(val) = map.get(FAILURE_KEY.as_bytes()) {
            let msg = val
                .as_bytes()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .ok_or_else(|| Error::Tracker("failure reason is not a string".to_string()))?;
            return Ok(Response::Failure(msg));
        }

        let interval = match map.get(INTERVAL_KEY.as_bytes()) {
            None => None,
            Some(val) => Some(
                val.as_integer()
                    .and_then(|int| u64::try_from(int).ok())
                    .ok_or_else(|| Error::Tracker("invalid interval".to_string()))?,
            ),
        };

        let mut peers = match map.get(PEERS_KEY.as_bytes()) {
            None => return Err(Error::Tracker("response missing peers".to_string())),
            Some(BencodeType::ByteString(data)) => Self::parse_compact_peers(data)?,
            Some(BencodeType::List(items)) => Self::parse_peer_dicts(items)?,
            Some(_) => {
                return Err(Error::Tracker(
                    "peers is neither a compact string nor a list".to_string(),
                ))
            }
        };
        if let Some(val) = map.get(PEERS6_KEY.as_bytes()) {
            let data = val
                .as_bytes()
                .ok_or_else(|| Error::Tracker("peers6 is not a compact string".to_string()))?;
            peers.append(&mut Self::parse_compact_peers6(data)?);
        }
        Ok(Response::Success { interval, peers })
    }

    /// Parse peers encoded in "compact" form: 4 byte IPv4 address, 2 byte big-endian port
    fn parse_compact_peers(data: &[u8]) -> Result<Vec<Peer>> {
        if data.len() % COMPACT_PEER_LEN != 0 {
            return Err(Error::Tracker(format!(
                "compact peers length {} is not a multiple of {}",
                data.len(),
                COMPACT_PEER_LEN
            )));
        }
        Ok(data
            .chunks_exact(COMPACT_PEER_LEN)
            .map(|chunk| Peer {
                ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                port: u16::from_be_bytes([chunk[4], chunk[5]]),
            })
            .collect())
    }

    /// Parse IPv6 peers encoded in "compact" form: 16 byte address, 2 byte big-endian port
    fn parse_compact_peers6(data: &[u8]) -> Result<Vec<Peer>> {
        if data.len() % COMPACT_PEER6_LEN != 0 {
            return Err(Error::Tracker(format!(
                "compact peers6 length {} is not a multiple of {}",
                data.len(),
                COMPACT_PEER6_LEN
            )));
        }
        Ok(data
            .chunks_exact(COMPACT_PEER6_LEN)
            .map(|chunk| {
                let mut octets = [0; 16];
                octets.copy_from_slice(&chunk[..16]);
                Peer {
                    ip: IpAddr::V6(Ipv6Addr::from(octets)),
                    port: u16::from_be_bytes([chunk[16], chunk[17]]),
                }
            })
            .collect())
    }

    /// Parse peers given as a list of dicts with `ip` and `port` keys
    fn parse_peer_dicts(items: &[BencodeType]) -> Result<Vec<Peer>> {
        items
            .iter()
            .map(|item| {
                item.as_dict()
                    .ok_or_else(|| Error::Tracker("peer entry is not a dict".to_string()))
                    .and_then(Peer::from_dict)
            })
            .collect()
    }
}

/// Peer of file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peer {
    /// IP address of peer
    pub ip: IpAddr,
    /// Port of peer
    pub port: u16,
}

impl Peer {
    fn from_dict(dict: &BencodeDict) -> Result<Peer> {
        let ip = dict
            .get(b"ip")
            .and_then(BencodeType::as_bytes)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(|text| text.parse::<IpAddr>().ok())
            .ok_or_else(|| Error::Tracker("peer entry has no valid ip".to_string()))?;
        let port = dict
            .get(b"port")
            .and_then(BencodeType::as_integer)
            .and_then(|int| u16::try_from(int).ok())
            .ok_or_else(|| Error::Tracker("peer entry has no valid port".to_string()))?;
        Ok(Peer { ip, port })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// Query the tracker for peers sharing the file
#[instrument(skip_all, fields(tracker = %metainfo.announce))]
pub async fn announce(metainfo: &Metainfo, config: &Config) -> Result<Vec<Peer>> {
    let request = Request::new(
        &metainfo.announce,
        &metainfo.info_hash,
        metainfo.info.length,
        config,
    )?;
    let data = request.send().await?;
    match Response::deserialise(&data)? {
        Response::Failure(reason) => {
            warn!("Tracker reported failure: {}", reason);
            Err(Error::Tracker(reason))
        }
        Response::Success { interval, peers } => {
            info!("Tracker returned {} peers (interval {:?})", peers.len(), interval);
            Ok(peers)
        }
    }
}
