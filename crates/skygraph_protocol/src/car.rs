/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Minimal CARv1 reader: enough to map the CIDs of a commit's block
//! section to their raw record bytes.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;

/// Parse a CARv1 archive into a CID-bytes -> block-bytes map.
pub fn read_blocks(data: &[u8]) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
    let mut pos = 0usize;

    let (header_len, n) = read_uvarint(&data[pos..]).context("car header length")?;
    pos += n;
    let header_len = header_len as usize;
    if pos + header_len > data.len() {
        bail!("car header truncated");
    }
    pos += header_len;

    let mut blocks = HashMap::new();
    while pos < data.len() {
        let (block_len, n) = read_uvarint(&data[pos..]).context("car block length")?;
        pos += n;
        let block_len = block_len as usize;
        if pos + block_len > data.len() {
            bail!("car block truncated at offset {pos}");
        }
        let block = &data[pos..pos + block_len];
        let cid_len = cid_length(block)?;
        blocks.insert(block[..cid_len].to_vec(), block[cid_len..].to_vec());
        pos += block_len;
    }

    Ok(blocks)
}

/// Byte length of the CID at the head of a block.
fn cid_length(block: &[u8]) -> Result<usize> {
    if block.len() >= 2 && block[0] == 0x12 && block[1] == 0x20 {
        // CIDv0: bare sha2-256 multihash.
        if block.len() < 34 {
            bail!("truncated cidv0");
        }
        return Ok(34);
    }

    let mut pos = 0usize;
    let (version, n) = read_uvarint(&block[pos..]).context("cid version")?;
    pos += n;
    if version != 1 {
        bail!("unsupported cid version {version}");
    }
    let (_codec, n) = read_uvarint(&block[pos..]).context("cid codec")?;
    pos += n;
    let (_hash_code, n) = read_uvarint(&block[pos..]).context("multihash code")?;
    pos += n;
    let (digest_len, n) = read_uvarint(&block[pos..]).context("multihash length")?;
    pos += n;
    let end = pos + digest_len as usize;
    if end > block.len() {
        bail!("truncated cid digest");
    }
    Ok(end)
}

/// Unsigned LEB128. Returns (value, bytes consumed).
fn read_uvarint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in data.iter().enumerate() {
        if shift >= 64 {
            bail!("uvarint overflow");
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    bail!("uvarint truncated");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            buf.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    fn cid_v1(seed: u8) -> Vec<u8> {
        // version 1, dag-cbor codec (0x71), sha2-256 (0x12), 32-byte digest
        let mut cid = vec![0x01, 0x71, 0x12, 0x20];
        cid.extend(std::iter::repeat(seed).take(32));
        cid
    }

    fn build_car(blocks: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        let header = b"\xa2eroots\x80gversion\x01".to_vec();
        write_uvarint(&mut out, header.len() as u64);
        out.extend_from_slice(&header);
        for (cid, data) in blocks {
            write_uvarint(&mut out, (cid.len() + data.len()) as u64);
            out.extend_from_slice(cid);
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn reads_v1_blocks() {
        let a = (cid_v1(1), b"record-a".to_vec());
        let b = (cid_v1(2), b"record-b".to_vec());
        let car = build_car(&[a.clone(), b.clone()]);

        let blocks = read_blocks(&car).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks.get(&a.0).unwrap(), &a.1);
        assert_eq!(blocks.get(&b.0).unwrap(), &b.1);
    }

    #[test]
    fn reads_v0_cid() {
        let mut cid = vec![0x12, 0x20];
        cid.extend(std::iter::repeat(7u8).take(32));
        let car = build_car(&[(cid.clone(), b"legacy".to_vec())]);

        let blocks = read_blocks(&car).unwrap();
        assert_eq!(blocks.get(&cid).unwrap(), b"legacy");
    }

    #[test]
    fn rejects_truncated_block() {
        let mut car = build_car(&[(cid_v1(3), b"whole".to_vec())]);
        car.truncate(car.len() - 2);
        assert!(read_blocks(&car).is_err());
    }

    #[test]
    fn uvarint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, value);
            let (decoded, used) = read_uvarint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }
}
