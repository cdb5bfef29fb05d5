//! Reader for the CARv1 block bundles carried by commit messages.
//!
//! # Layout
//!
//! ```text
//! varint(len) dag-cbor header { version: 1, roots: [cid, ...] }
//! varint(len) cid bytes || block bytes
//! varint(len) cid bytes || block bytes
//! ...
//! ```
//!
//! Lengths are unsigned LEB128. Blocks addressed by a sha2-256 CID are checked
//! against their hash on load.

use std::collections::HashMap;
use std::io::Cursor;

use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Multihash code of sha2-256.
pub const SHA2_256: u64 = 0x12;

/// Upper bound on a single section, well above any repo block.
const MAX_SECTION_LEN: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarHeader {
    pub version: u64,
    pub roots: Vec<Cid>,
}

/// Blocks of one bundle, addressed by CID.
#[derive(Debug, Default, Clone)]
pub struct BlockMap {
    blocks: HashMap<Cid, Vec<u8>>,
}

impl BlockMap {
    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A parsed bundle.
#[derive(Debug, Clone)]
pub struct Car {
    pub root: Option<Cid>,
    pub blocks: BlockMap,
}

/// Read an unsigned LEB128 varint, advancing `buf`.
pub fn read_varint(buf: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..10 {
        let Some((&byte, rest)) = buf.split_first() else {
            return Err(Error::Decode("truncated varint".to_string()));
        };
        *buf = rest;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Decode("varint overflows u64".to_string()))
}

/// Append `value` as an unsigned LEB128 varint.
pub fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn take_section<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_varint(buf)?;
    if len > MAX_SECTION_LEN {
        return Err(Error::Decode(format!("CAR section of {len} bytes is too large")));
    }
    let len = len as usize;
    if buf.len() < len {
        return Err(Error::Decode(format!(
            "CAR section needs {len} bytes, {} left",
            buf.len()
        )));
    }
    let (section, rest) = buf.split_at(len);
    *buf = rest;
    Ok(section)
}

fn verify(cid: &Cid, block: &[u8]) -> Result<()> {
    let hash = cid.hash();
    if hash.code() == SHA2_256 && Sha256::digest(block).as_slice() != hash.digest() {
        return Err(Error::Decode(format!("block {cid} does not match its hash")));
    }
    Ok(())
}

/// Parse a CARv1 bundle.
pub fn read_car(bytes: &[u8]) -> Result<Car> {
    let mut buf = bytes;

    let header_bytes = take_section(&mut buf)?;
    let header: CarHeader = serde_ipld_dagcbor::from_slice(header_bytes)
        .map_err(|e| Error::Decode(format!("CAR header: {e}")))?;
    if header.version != 1 {
        return Err(Error::Decode(format!(
            "unsupported CAR version {}",
            header.version
        )));
    }

    let mut blocks = HashMap::new();
    while !buf.is_empty() {
        let section = take_section(&mut buf)?;
        let mut cursor = Cursor::new(section);
        let cid = Cid::read_bytes(&mut cursor)
            .map_err(|e| Error::Decode(format!("CAR block cid: {e}")))?;
        let block = &section[cursor.position() as usize..];
        verify(&cid, block)?;
        blocks.insert(cid, block.to_vec());
    }

    Ok(Car {
        root: header.roots.first().copied(),
        blocks: BlockMap { blocks },
    })
}

/// Encode a CARv1 bundle.
pub fn write_car(root: Option<Cid>, blocks: &[(Cid, Vec<u8>)]) -> Result<Vec<u8>> {
    let header = CarHeader {
        version: 1,
        roots: root.into_iter().collect(),
    };
    let header_bytes = serde_ipld_dagcbor::to_vec(&header)
        .map_err(|e| Error::Decode(format!("CAR header: {e}")))?;

    let mut out = Vec::new();
    write_varint(header_bytes.len() as u64, &mut out);
    out.extend_from_slice(&header_bytes);

    for (cid, block) in blocks {
        let cid_bytes = cid.to_bytes();
        write_varint((cid_bytes.len() + block.len()) as u64, &mut out);
        out.extend_from_slice(&cid_bytes);
        out.extend_from_slice(block);
    }
    Ok(out)
}
