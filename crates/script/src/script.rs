//! Opcode iteration and signature-operation counting.

use ldoged_consensus::constants::{MAX_MULTISIG_PUBKEYS, MAX_SCRIPT_SIZE};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    /// Pushed bytes for data pushes, `None` for every other opcode.
    pub data: Option<&'a [u8]>,
}

/// Iterates the opcodes of a raw script. Yields `None` after the first
/// truncated push and marks the iterator as failed.
pub struct Instructions<'a> {
    script: &'a [u8],
    position: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self {
            script,
            position: 0,
            failed: false,
        }
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(len)?;
        let slice = self.script.get(self.position..end)?;
        self.position = end;
        Some(slice)
    }

    fn push_len(&mut self, opcode: u8) -> Option<usize> {
        match opcode {
            OP_PUSHDATA1 => self.take(1).map(|bytes| bytes[0] as usize),
            OP_PUSHDATA2 => self
                .take(2)
                .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]) as usize),
            OP_PUSHDATA4 => self
                .take(4)
                .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize),
            _ => Some(opcode as usize),
        }
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.script.len() {
            return None;
        }
        let opcode = self.script[self.position];
        self.position += 1;
        if opcode > OP_PUSHDATA4 {
            return Some(Instruction { opcode, data: None });
        }
        let data = self.push_len(opcode).and_then(|len| self.take(len));
        match data {
            Some(data) => Some(Instruction {
                opcode,
                data: Some(data),
            }),
            None => {
                self.failed = true;
                None
            }
        }
    }
}

/// Outputs that can be dropped from the coin set as soon as they are created.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.len() > MAX_SCRIPT_SIZE || script.first() == Some(&OP_RETURN)
}

/// `OP_HASH160 <20 bytes> OP_EQUAL`
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// True when every opcode is a data push or small integer and the script parses.
pub fn is_push_only(script: &[u8]) -> bool {
    let mut instructions = Instructions::new(script);
    let all_push = instructions.by_ref().all(|instruction| instruction.opcode <= OP_16);
    all_push && !instructions.failed()
}

/// Counts signature operations. With `accurate` set, multisig ops preceded by
/// a small integer count that many keys instead of the maximum.
pub fn sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut total = 0u32;
    let mut last_opcode: Option<u8> = None;
    for instruction in Instructions::new(script) {
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => total += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => match last_opcode {
                Some(op) if accurate && (OP_1..=OP_16).contains(&op) => {
                    total += u32::from(op - OP_1 + 1);
                }
                _ => total += MAX_MULTISIG_PUBKEYS,
            },
            _ => {}
        }
        last_opcode = Some(instruction.opcode);
    }
    total
}

/// Sigops of the redeem script pushed last by `script_sig` when spending a
/// pay-to-script-hash output.
pub fn p2sh_sigop_count(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) || !is_push_only(script_sig) {
        return 0;
    }
    let redeem = Instructions::new(script_sig)
        .last()
        .and_then(|instruction| instruction.data);
    match redeem {
        Some(redeem) if !redeem.is_empty() => sigop_count(redeem, true),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2sh_script() -> Vec<u8> {
        let mut script = vec![OP_HASH160, 0x14];
        script.extend_from_slice(&[0xab; 20]);
        script.push(OP_EQUAL);
        script
    }

    #[test]
    fn iterates_pushdata_forms() {
        let mut script = vec![0x02, 0xaa, 0xbb, OP_PUSHDATA1, 0x01, 0xcc];
        script.extend_from_slice(&[OP_PUSHDATA2, 0x01, 0x00, 0xdd, OP_CHECKSIG]);
        let ops: Vec<_> = Instructions::new(&script).collect();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].data, Some(&[0xaa, 0xbb][..]));
        assert_eq!(ops[1].data, Some(&[0xcc][..]));
        assert_eq!(ops[2].data, Some(&[0xdd][..]));
        assert_eq!(ops[3].opcode, OP_CHECKSIG);
    }

    #[test]
    fn truncated_push_stops_iteration() {
        let script = [OP_CHECKSIG, 0x05, 0x01];
        let mut instructions = Instructions::new(&script);
        assert_eq!(instructions.next().map(|op| op.opcode), Some(OP_CHECKSIG));
        assert_eq!(instructions.next(), None);
        assert!(instructions.failed());
        assert!(!is_push_only(&[0x05, 0x01]));
    }

    #[test]
    fn legacy_and_accurate_multisig_counts() {
        let script = [OP_1 + 1, OP_CHECKMULTISIG, OP_CHECKSIG];
        assert_eq!(sigop_count(&script, false), 21);
        assert_eq!(sigop_count(&script, true), 3);
    }

    #[test]
    fn p2sh_counts_redeem_script() {
        let redeem = [OP_1, OP_1 + 2, OP_CHECKMULTISIG];
        let mut script_sig = vec![OP_0, redeem.len() as u8];
        script_sig.extend_from_slice(&redeem);
        assert!(is_p2sh(&p2sh_script()));
        assert_eq!(p2sh_sigop_count(&p2sh_script(), &script_sig), 3);
        assert_eq!(p2sh_sigop_count(&[OP_CHECKSIG], &script_sig), 0);
        assert_eq!(p2sh_sigop_count(&p2sh_script(), &[OP_CHECKSIG]), 0);
    }

    #[test]
    fn op_return_and_oversized_scripts_are_unspendable() {
        assert!(is_unspendable(&[OP_RETURN, 0x01, 0x00]));
        assert!(is_unspendable(&vec![OP_1; MAX_SCRIPT_SIZE + 1]));
        assert!(!is_unspendable(&[OP_1]));
        assert!(!is_unspendable(&[]));
    }
}
