//! The 80-byte block header and the hashing done over it.
//!
//! Headers are kept in serialized block order: little-endian integers,
//! hashes in internal byte order. Getwork transports the same bytes with
//! every 32-bit word byte-swapped; [`from_getwork_data`] and
//! [`to_getwork_data`] convert at that boundary.

use bitcoin::hashes::{Hash, sha256d};
use bitcoin::pow::{CompactTarget, Target};
use sha2::digest::generic_array::GenericArray;

use super::WorkError;

pub const HEADER_LEN: usize = 80;

pub type Header = [u8; HEADER_LEN];

const VERSION: usize = 0;
const PREV_HASH: usize = 4;
const MERKLE_ROOT: usize = 36;
const TIME: usize = 68;
const BITS: usize = 72;
const NONCE: usize = 76;

const SHA256_H0: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

fn read_u32(header: &Header, at: usize) -> u32 {
    u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
}

fn write_u32(header: &mut Header, at: usize, value: u32) {
    header[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn version(header: &Header) -> u32 {
    read_u32(header, VERSION)
}

pub fn prev_hash(header: &Header) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&header[PREV_HASH..PREV_HASH + 32]);
    hash
}

pub fn merkle_root(header: &Header) -> [u8; 32] {
    let mut root = [0u8; 32];
    root.copy_from_slice(&header[MERKLE_ROOT..MERKLE_ROOT + 32]);
    root
}

pub fn ntime(header: &Header) -> u32 {
    read_u32(header, TIME)
}

pub fn set_ntime(header: &mut Header, ntime: u32) {
    write_u32(header, TIME, ntime);
}

pub fn bits(header: &Header) -> u32 {
    read_u32(header, BITS)
}

pub fn nonce(header: &Header) -> u32 {
    read_u32(header, NONCE)
}

pub fn set_nonce(header: &mut Header, nonce: u32) {
    write_u32(header, NONCE, nonce);
}

/// Target encoded in the header's bits field.
pub fn network_target(header: &Header) -> Target {
    Target::from_compact(CompactTarget::from_consensus(bits(header)))
}

/// Assemble a header from its fields with a zero nonce.
pub fn assemble(
    version: u32,
    prev_hash: &[u8; 32],
    merkle_root: &[u8; 32],
    ntime: u32,
    bits: u32,
) -> Header {
    let mut header = [0u8; HEADER_LEN];
    write_u32(&mut header, VERSION, version);
    header[PREV_HASH..PREV_HASH + 32].copy_from_slice(prev_hash);
    header[MERKLE_ROOT..MERKLE_ROOT + 32].copy_from_slice(merkle_root);
    write_u32(&mut header, TIME, ntime);
    write_u32(&mut header, BITS, bits);
    header
}

/// SHA-256 state after compressing the first 64 header bytes.
///
/// Devices finish the hash from here, so only the last 16 bytes (merkle
/// tail, time, bits, nonce) are hashed per nonce.
pub fn midstate(header: &Header) -> [u8; 32] {
    let mut state = SHA256_H0;
    let block = GenericArray::clone_from_slice(&header[..64]);
    sha2::compress256(&mut state, &[block]);

    let mut out = [0u8; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// Double SHA-256 of the header, in internal byte order.
pub fn hash(header: &Header) -> [u8; 32] {
    hash_bytes(header)
}

pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

/// Whether the header with its current nonce meets `target`.
pub fn meets_target(header: &Header, target: Target) -> bool {
    Target::from_le_bytes(hash(header)) <= target
}

fn swap_words(bytes: &mut [u8]) {
    for word in bytes.chunks_exact_mut(4) {
        word.reverse();
    }
}

/// Decode getwork `data`: 128 bytes (80 of header plus SHA-256 padding),
/// word-swapped.
pub fn from_getwork_data(data: &[u8]) -> Result<Header, WorkError> {
    if data.len() < HEADER_LEN {
        return Err(WorkError::BadHeader(data.len()));
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&data[..HEADER_LEN]);
    swap_words(&mut header);
    Ok(header)
}

/// Encode a header as getwork `data`, padded to 128 bytes.
pub fn to_getwork_data(header: &Header) -> [u8; 128] {
    let mut data = [0u8; 128];
    data[..HEADER_LEN].copy_from_slice(header);
    // SHA-256 padding for an 80-byte message
    data[HEADER_LEN] = 0x80;
    data[126] = 0x02;
    data[127] = 0x80;
    swap_words(&mut data);
    data
}

/// Double SHA-256 merkle root from a leaf hash and its authentication path.
pub fn merkle_root_from_branch(leaf: [u8; 32], branch: &[[u8; 32]]) -> [u8; 32] {
    branch.iter().fold(leaf, |acc, sibling| {
        let mut pair = [0u8; 64];
        pair[..32].copy_from_slice(&acc);
        pair[32..].copy_from_slice(sibling);
        hash_bytes(&pair)
    })
}

/// Merkle root over a full list of txids.
pub fn merkle_root_from_txids(txids: &[[u8; 32]]) -> Option<[u8; 32]> {
    let mut level: Vec<[u8; 32]> = txids.to_vec();
    if level.is_empty() {
        return None;
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks_exact(2)
            .map(|pair| merkle_root_from_branch(pair[0], &pair[1..]))
            .collect();
    }
    Some(level[0])
}

/// BIP34 height from a coinbase's scriptSig.
///
/// `offset` points at the push opcode that starts the scriptSig. The height
/// is a minimally encoded little-endian number of one to eight bytes.
pub fn bip34_height(coinbase: &[u8], offset: usize) -> Option<u64> {
    let len = *coinbase.get(offset)? as usize;
    if !(1..=8).contains(&len) {
        return None;
    }
    let bytes = coinbase.get(offset + 1..offset + 1 + len)?;
    Some(
        bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
    )
}

/// Offset of the scriptSig push in a stratum coinbase1: version, input
/// count, previous outpoint and script length.
pub const STRATUM_HEIGHT_OFFSET: usize = 42;
