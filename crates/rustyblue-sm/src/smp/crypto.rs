//! Security Manager crypto toolbox (Vol 3, Part H, 2.2)
//!
//! The toolbox functions are built from single AES-128 blocks and AES-CMAC runs
//! that the security manager schedules on the controller. This module only
//! assembles their inputs and post-processes their outputs. All values are most
//! significant octet first, the order Bluetooth Core test vectors use.

use super::constants::*;
use crate::gap::{AddressType, BdAddr};

/// Length of the f4 message: U || V || Z
pub const F4_MESSAGE_LEN: usize = 65;
/// Length of the f5 message: Counter || keyID || N1 || N2 || A1 || A2 || Length
pub const F5_MESSAGE_LEN: usize = 53;
/// Length of the f6 message: N1 || N2 || R || IOcap || A1 || A2
pub const F6_MESSAGE_LEN: usize = 65;
/// Length of the g2 message: U || V || Y
pub const G2_MESSAGE_LEN: usize = 80;

pub fn xor_128(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// 56-bit address input of f5 and f6: type octet followed by the address
pub fn address_with_type(address_type: AddressType, address: &BdAddr) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[0] = address_type.smp_type();
    out[1..].copy_from_slice(&address.to_be_bytes());
    out
}

/// First AES input of c1: r XOR p1, with p1 = pres || preq || rat || iat
///
/// `preq` and `pres` are the Pairing Request/Response PDUs in transmission
/// order, code first.
pub fn c1_t1(
    r: &[u8; 16],
    preq: &[u8; 7],
    pres: &[u8; 7],
    initiator_address_type: u8,
    responder_address_type: u8,
) -> [u8; 16] {
    let mut p1 = [0u8; 16];
    for i in 0..7 {
        p1[i] = pres[6 - i];
        p1[7 + i] = preq[6 - i];
    }
    p1[14] = responder_address_type;
    p1[15] = initiator_address_type;
    xor_128(r, &p1)
}

/// Second AES input of c1: t2 XOR p2, with p2 = padding || ia || ra
pub fn c1_t3(t2: &[u8; 16], initiator_address: &BdAddr, responder_address: &BdAddr) -> [u8; 16] {
    let mut p2 = [0u8; 16];
    p2[4..10].copy_from_slice(&initiator_address.to_be_bytes());
    p2[10..16].copy_from_slice(&responder_address.to_be_bytes());
    xor_128(t2, &p2)
}

/// AES input of s1: least significant halves of r1 and r2
pub fn s1_r_prime(r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    let mut r_prime = [0u8; 16];
    r_prime[..8].copy_from_slice(&r1[8..]);
    r_prime[8..].copy_from_slice(&r2[8..]);
    r_prime
}

/// AES input of the diversifying function d1: padding || r || d
pub fn d1_d_prime(d: u16, r: u16) -> [u8; 16] {
    let mut d_prime = [0u8; 16];
    d_prime[12..14].copy_from_slice(&r.to_be_bytes());
    d_prime[14..16].copy_from_slice(&d.to_be_bytes());
    d_prime
}

/// AES input of the mask generation function dm: padding || rand
pub fn dm_r_prime(rand: &[u8; 8]) -> [u8; 16] {
    let mut r_prime = [0u8; 16];
    r_prime[8..].copy_from_slice(rand);
    r_prime
}

/// dm(k, r) mod 2^16 from the AES output
pub fn dm_y(ciphertext: &[u8; 16]) -> u16 {
    u16::from_be_bytes([ciphertext[14], ciphertext[15]])
}

/// AES input of the random address hash function ah: padding || prand
pub fn ah_r_prime(prand: &[u8; 3]) -> [u8; 16] {
    let mut r_prime = [0u8; 16];
    r_prime[13..].copy_from_slice(prand);
    r_prime
}

/// ah(k, r) mod 2^24 from the AES output
pub fn ah_hash(ciphertext: &[u8; 16]) -> [u8; 3] {
    [ciphertext[13], ciphertext[14], ciphertext[15]]
}

/// f4 message: U || V || Z, keyed by X
pub fn f4_message(u: &[u8; 32], v: &[u8; 32], z: u8) -> Vec<u8> {
    let mut message = Vec::with_capacity(F4_MESSAGE_LEN);
    message.extend_from_slice(u);
    message.extend_from_slice(v);
    message.push(z);
    message
}

/// f5 message for one of its two CMAC runs, keyed by T = CMAC(SALT, W)
///
/// Counter 0 yields the MacKey, counter 1 the LTK.
pub fn f5_message(counter: u8, n1: &[u8; 16], n2: &[u8; 16], a1: &[u8; 7], a2: &[u8; 7]) -> Vec<u8> {
    let mut message = Vec::with_capacity(F5_MESSAGE_LEN);
    message.push(counter);
    message.extend_from_slice(&SMP_F5_KEY_ID);
    message.extend_from_slice(n1);
    message.extend_from_slice(n2);
    message.extend_from_slice(a1);
    message.extend_from_slice(a2);
    message.extend_from_slice(&SMP_F5_LENGTH);
    message
}

/// f6 message: N1 || N2 || R || IOcap || A1 || A2, keyed by the MacKey
pub fn f6_message(
    n1: &[u8; 16],
    n2: &[u8; 16],
    r: &[u8; 16],
    io_cap: &[u8; 3],
    a1: &[u8; 7],
    a2: &[u8; 7],
) -> Vec<u8> {
    let mut message = Vec::with_capacity(F6_MESSAGE_LEN);
    message.extend_from_slice(n1);
    message.extend_from_slice(n2);
    message.extend_from_slice(r);
    message.extend_from_slice(io_cap);
    message.extend_from_slice(a1);
    message.extend_from_slice(a2);
    message
}

/// g2 message: U || V || Y, keyed by X
pub fn g2_message(u: &[u8; 32], v: &[u8; 32], y: &[u8; 16]) -> Vec<u8> {
    let mut message = Vec::with_capacity(G2_MESSAGE_LEN);
    message.extend_from_slice(u);
    message.extend_from_slice(v);
    message.extend_from_slice(y);
    message
}

/// Six digit numeric comparison value from the g2 CMAC output
pub fn g2_value(mac: &[u8; 16]) -> u32 {
    u32::from_be_bytes([mac[12], mac[13], mac[14], mac[15]]) % 1_000_000
}

/// h6 message, the key ID, keyed by W
pub fn h6_message(key_id: u32) -> Vec<u8> {
    key_id.to_be_bytes().to_vec()
}

/// h7 SALT for a key ID: zero padding followed by the key ID
pub fn h7_salt(key_id: u32) -> [u8; 16] {
    let mut salt = [0u8; 16];
    salt[12..].copy_from_slice(&key_id.to_be_bytes());
    salt
}

/// f4 Z for one passkey entry round: 0x80 plus the committed passkey bit
pub fn passkey_round_z(passkey: u32, bit: u8) -> u8 {
    0x80 | ((passkey >> bit) & 1) as u8
}

/// Keep the `key_size` least significant octets, zero the rest
pub fn truncate_key(key: &mut [u8; 16], key_size: u8) {
    let keep = (key_size as usize).min(16);
    for byte in key.iter_mut().take(16 - keep) {
        *byte = 0;
    }
}

/// Six digit passkey from four random octets (least significant first)
pub fn passkey_from_random(random: &[u8]) -> u32 {
    let mut value = [0u8; 4];
    for (dst, src) in value.iter_mut().zip(random) {
        *dst = *src;
    }
    let mut passkey = u32::from_le_bytes(value) & 0xFFFFF;
    if passkey >= SMP_PASSKEY_MAX {
        passkey -= SMP_PASSKEY_MAX;
    }
    passkey
}

/// TK holding a passkey, big-endian in the last four octets
pub fn tk_from_passkey(passkey: u32) -> [u8; 16] {
    let mut tk = [0u8; 16];
    tk[12..].copy_from_slice(&passkey.to_be_bytes());
    tk
}

pub fn passkey_from_tk(tk: &[u8; 16]) -> u32 {
    u32::from_be_bytes([tk[12], tk[13], tk[14], tk[15]])
}
