use crate::error::{Error, Result};
use crate::parse::{BencodeDict, BencodeType};
use crate::SHA1_LEN;

const ANNOUNCE_KEY: &str = "announce";
const INFO_KEY: &str = "info";
const NAME_KEY: &str = "name";
const LENGTH_KEY: &str = "length";
const PIECE_LENGTH_KEY: &str = "piece length";
const PIECES_KEY: &str = "pieces";

/// Metainfo (`.torrent`) file
#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    /// URL of the tracker
    pub announce: String,
    /// Info dict describing the file
    pub info: Info,
    /// SHA1 hash of the canonical bencoding of the `info` dict
    pub info_hash: [u8; SHA1_LEN],
}

/// Info dict within metainfo file
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// Suggested name of the file
    pub name: Option<String>,
    /// Length of the file in bytes
    pub length: u64,
    /// Length of every piece but (possibly) the last, in bytes
    pub piece_length: u32,
    /// SHA1 hash of each piece, in piece order
    pub pieces: Vec<[u8; SHA1_LEN]>,
}

fn missing_key(dict_name: &str, key: &str) -> Error {
    Error::InvalidMetadata(format!(
        "{} dict missing the following key: {}",
        dict_name, key
    ))
}

fn incorrect_type(key: &str) -> Error {
    Error::InvalidMetadata(format!(
        "the following key's value has an incorrect type: {}",
        key
    ))
}

fn get<'a>(dict: &'a BencodeDict, dict_name: &str, key: &str) -> Result<&'a BencodeType> {
    dict.get(key.as_bytes())
        .ok_or_else(|| missing_key(dict_name, key))
}

fn get_integer(dict: &BencodeDict, dict_name: &str, key: &str) -> Result<i64> {
    get(dict, dict_name, key)?
        .as_integer()
        .ok_or_else(|| incorrect_type(key))
}

fn get_string(dict: &BencodeDict, dict_name: &str, key: &str) -> Result<String> {
    let bytes = get(dict, dict_name, key)?
        .as_bytes()
        .ok_or_else(|| incorrect_type(key))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::InvalidMetadata(format!("{} is not valid UTF-8", key)))
}

impl Metainfo {
    /// Decode the contents of a `.torrent` file
    pub fn load(bytes: &[u8]) -> Result<Metainfo> {
        let data = crate::parse::parse(bytes)?;
        Metainfo::new(&data)
    }

    /// Interpret a decoded bencode value as metainfo
    pub fn new(data: &BencodeType) -> Result<Metainfo> {
        let dict = data.as_dict().ok_or_else(|| {
            Error::InvalidMetadata("metainfo file must be a dict".to_string())
        })?;
        let announce = get_string(dict, "metainfo", ANNOUNCE_KEY)?;
        let info_value = get(dict, "metainfo", INFO_KEY)?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| incorrect_type(INFO_KEY))?;
        let info = Info::new(info_dict)?;
        let bencoded_info = crate::serialise::serialise(info_value);
        let info_hash = sha1_smol::Sha1::from(bencoded_info).digest().bytes();
        Ok(Metainfo {
            announce,
            info,
            info_hash,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len()
    }

    /// Expected size of the piece with the given index
    ///
    /// Every piece is `piece_length` bytes except the last, which holds the
    /// remainder of the file.
    pub fn piece_size(&self, index: u32) -> Result<u32> {
        let count = self.piece_count();
        let idx = index as usize;
        if idx >= count {
            return Err(Error::InvalidPieceIndex { index, count });
        }
        if idx + 1 < count {
            return Ok(self.info.piece_length);
        }
        let remainder = self.info.length % u64::from(self.info.piece_length);
        match remainder {
            0 => Ok(self.info.piece_length),
            rem => Ok(rem as u32),
        }
    }

    /// Expected SHA1 hash of the piece with the given index
    pub fn piece_hash(&self, index: u32) -> Result<&[u8; SHA1_LEN]> {
        self.info
            .pieces
            .get(index as usize)
            .ok_or(Error::InvalidPieceIndex {
                index,
                count: self.piece_count(),
            })
    }
}

impl Info {
    fn new(dict: &BencodeDict) -> Result<Info> {
        let name = match dict.get(NAME_KEY.as_bytes()) {
            Some(_) => Some(get_string(dict, "info", NAME_KEY)?),
            None => None,
        };

        let length = u64::try_from(get_integer(dict, "info", LENGTH_KEY)?)
            .map_err(|_| Error::InvalidMetadata("length must not be negative".to_string()))?;

        let piece_length = u32::try_from(get_integer(dict, "info", PIECE_LENGTH_KEY)?)
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| {
                Error::InvalidMetadata(
                    "piece length must be a positive 32-bit integer".to_string(),
                )
            })?;

        let pieces = get(dict, "info", PIECES_KEY)?
            .as_bytes()
            .ok_or_else(|| incorrect_type(PIECES_KEY))?;
        if pieces.len() % SHA1_LEN != 0 {
            return Err(Error::InvalidMetadata(format!(
                "pieces length {} is not a multiple of {}",
                pieces.len(),
                SHA1_LEN
            )));
        }
        let pieces = pieces
            .chunks_exact(SHA1_LEN)
            .map(|chunk| {
                let mut hash = [0; SHA1_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect::<Vec<_>>();

        let expected_count = length.div_ceil(u64::from(piece_length));
        if expected_count != pieces.len() as u64 {
            return Err(Error::InvalidMetadata(format!(
                "expected {} piece hashes for length {} and piece length {}, found {}",
                expected_count,
                length,
                piece_length,
                pieces.len()
            )));
        }

        Ok(Info {
            name,
            length,
            piece_length,
            pieces,
        })
    }
}
