use bitcoin::blockdata::script::{Instruction, Instructions, Script};
use bitcoin::opcodes::all::{OP_PUSHNUM_1, OP_PUSHNUM_16, OP_RETURN};

use crate::modules::swapdata::consts::{FLAG_HAS_WANT, RSWP_TAG};
use crate::modules::swapdata::schemas::SwapOffer;

/// Parse one transaction output script as a swap advertisement.
///
/// Expected layout:
/// `OP_RETURN "RSWP" <version> [v2: <flags> <offered_type> <terms_type>]
///  <token_id> [v2+HAS_WANT: <want_token_id>] <utxo_hash> <utxo_index>
///  <price_terms...> <signature>`
///
/// Returns `None` for anything that is not a well-formed advertisement; a
/// rejected output never affects its siblings.
pub fn parse_swap_offer(script: &Script, height: i32) -> Option<SwapOffer> {
    if script.as_bytes().first() != Some(&OP_RETURN.to_u8()) {
        return None;
    }

    let mut it = script.instructions();
    match it.next()? {
        Ok(Instruction::Op(OP_RETURN)) => {}
        _ => return None,
    }

    let tag = next_push(&mut it)?;
    if tag != RSWP_TAG {
        return None;
    }

    let version = next_push_byte(&mut it)?;

    if version == 2 {
        let flags = next_push_byte(&mut it)?;
        let offered_type = next_push_byte(&mut it)?;
        let terms_type = next_push_byte(&mut it)?;
        let token_id = next_push_32(&mut it)?;

        let want_token_id = if flags & FLAG_HAS_WANT != 0 {
            next_push_32(&mut it)?
        } else {
            [0u8; 32]
        };

        let offered_utxo_hash = next_push_32(&mut it)?;
        let offered_utxo_index = next_index(&mut it)?;

        // The last remaining push is the signature; everything between the
        // index and the signature concatenates into the price terms.
        let mut tail: Vec<Vec<u8>> = Vec::new();
        for ins in it {
            match ins {
                Ok(Instruction::PushBytes(data)) => tail.push(data.as_bytes().to_vec()),
                _ => return None,
            }
        }
        if tail.len() < 2 {
            return None;
        }
        let signature = tail.pop()?;
        let price_terms = tail.concat();

        Some(SwapOffer {
            version,
            flags,
            offered_type,
            terms_type,
            token_id,
            offered_utxo_hash,
            offered_utxo_index,
            price_terms,
            want_token_id,
            signature,
            block_height: height,
        })
    } else {
        // Legacy v1 layout: a type byte (no longer carried in the stored
        // record), then token, utxo, single-push terms and signature.
        let type_byte = next_push(&mut it)?;
        if type_byte.len() != 1 {
            return None;
        }

        let token_id = next_push_32(&mut it)?;
        let offered_utxo_hash = next_push_32(&mut it)?;
        let offered_utxo_index = next_index(&mut it)?;
        let price_terms = next_push(&mut it)?;
        let signature = next_push(&mut it)?;

        Some(SwapOffer {
            version,
            flags: 0,
            offered_type: 0,
            terms_type: 0,
            token_id,
            offered_utxo_hash,
            offered_utxo_index,
            price_terms,
            want_token_id: [0u8; 32],
            signature,
            block_height: height,
        })
    }
}

fn next_push(it: &mut Instructions) -> Option<Vec<u8>> {
    match it.next()? {
        Ok(Instruction::PushBytes(data)) => Some(data.as_bytes().to_vec()),
        _ => None,
    }
}

fn next_push_byte(it: &mut Instructions) -> Option<u8> {
    let data = next_push(it)?;
    if data.len() != 1 {
        return None;
    }
    Some(data[0])
}

fn next_push_32(it: &mut Instructions) -> Option<[u8; 32]> {
    next_push(it)?.try_into().ok()
}

/// The UTXO index may arrive as a script-number push or as one of the
/// small-int opcodes.
fn next_index(it: &mut Instructions) -> Option<u32> {
    match it.next()? {
        Ok(Instruction::PushBytes(data)) => {
            let n = decode_script_num(data.as_bytes())?;
            Some(n as u32)
        }
        Ok(Instruction::Op(op)) => {
            let code = op.to_u8();
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&code) {
                Some((code - OP_PUSHNUM_1.to_u8() + 1) as u32)
            } else {
                None
            }
        }
        Err(_) => None,
    }
}

/// Little-endian signed script number, at most 4 bytes. Minimal encoding is
/// not required here.
fn decode_script_num(data: &[u8]) -> Option<i64> {
    if data.len() > 4 {
        return None;
    }
    if data.is_empty() {
        return Some(0);
    }
    let mut result: i64 = 0;
    for (i, b) in data.iter().enumerate() {
        result |= (*b as i64) << (8 * i);
    }
    if data[data.len() - 1] & 0x80 != 0 {
        result &= !(0x80i64 << (8 * (data.len() - 1)));
        result = -result;
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::script::{Builder, PushBytesBuf};
    use bitcoin::opcodes::all::{OP_DUP, OP_PUSHNUM_3};

    fn push_vec(builder: Builder, data: &[u8]) -> Builder {
        builder.push_slice(PushBytesBuf::try_from(data.to_vec()).unwrap())
    }

    fn v2_script(
        flags: u8,
        token: [u8; 32],
        want: Option<[u8; 32]>,
        hash: [u8; 32],
        index_push: &[u8],
        tail: &[&[u8]],
    ) -> bitcoin::ScriptBuf {
        let mut b = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(*b"RSWP")
            .push_slice([2u8])
            .push_slice([flags])
            .push_slice([0u8])
            .push_slice([0u8])
            .push_slice(token);
        if let Some(w) = want {
            b = b.push_slice(w);
        }
        b = b.push_slice(hash);
        b = push_vec(b, index_push);
        for t in tail {
            b = push_vec(b, t);
        }
        b.into_script()
    }

    #[test]
    fn parses_v2_advertisement() {
        let script = v2_script(
            0,
            [0x11; 32],
            None,
            [0xAA; 32],
            &[3],
            &[&[0x01], &[0x02]],
        );
        let offer = parse_swap_offer(&script, 100).expect("offer");
        assert_eq!(offer.version, 2);
        assert_eq!(offer.flags, 0);
        assert_eq!(offer.token_id, [0x11; 32]);
        assert_eq!(offer.offered_utxo_hash, [0xAA; 32]);
        assert_eq!(offer.offered_utxo_index, 3);
        assert_eq!(offer.price_terms, vec![0x01]);
        assert_eq!(offer.signature, vec![0x02]);
        assert!(!offer.has_want());
        assert_eq!(offer.block_height, 100);
    }

    #[test]
    fn parses_want_token_when_flagged() {
        let script = v2_script(
            FLAG_HAS_WANT,
            [0x11; 32],
            Some([0x22; 32]),
            [0xAA; 32],
            &[0],
            &[&[0x01], &[0x02]],
        );
        let offer = parse_swap_offer(&script, 5).expect("offer");
        assert_eq!(offer.want_token_id, [0x22; 32]);
        assert!(offer.has_want());
    }

    #[test]
    fn small_int_opcode_encodes_index() {
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(*b"RSWP")
            .push_slice([2u8])
            .push_slice([0u8])
            .push_slice([0u8])
            .push_slice([0u8])
            .push_slice([0x11; 32])
            .push_slice([0xAA; 32])
            .push_opcode(OP_PUSHNUM_3)
            .push_slice([0x01])
            .push_slice([0x02])
            .into_script();
        let offer = parse_swap_offer(&script, 1).expect("offer");
        assert_eq!(offer.offered_utxo_index, 3);
    }

    #[test]
    fn multi_byte_script_number_index() {
        // 0x01F4 = 500, little-endian push
        let script = v2_script(
            0,
            [0x11; 32],
            None,
            [0xAA; 32],
            &[0xF4, 0x01],
            &[&[0x01], &[0x02]],
        );
        let offer = parse_swap_offer(&script, 1).expect("offer");
        assert_eq!(offer.offered_utxo_index, 500);
    }

    #[test]
    fn price_terms_concatenate_across_pushes() {
        let script = v2_script(
            0,
            [0x11; 32],
            None,
            [0xAA; 32],
            &[1],
            &[&[0xDE, 0xAD], &[0xBE, 0xEF], &[0x99]],
        );
        let offer = parse_swap_offer(&script, 1).expect("offer");
        assert_eq!(offer.price_terms, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(offer.signature, vec![0x99]);
    }

    #[test]
    fn parses_legacy_v1_advertisement() {
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(*b"RSWP")
            .push_slice([1u8])
            .push_slice([7u8]) // legacy type byte, discarded
            .push_slice([0x11; 32])
            .push_slice([0xAA; 32])
            .push_slice([4u8])
            .push_slice([0x01])
            .push_slice([0x02])
            .into_script();
        let offer = parse_swap_offer(&script, 9).expect("offer");
        assert_eq!(offer.version, 1);
        assert_eq!(offer.flags, 0);
        assert_eq!(offer.offered_type, 0);
        assert_eq!(offer.offered_utxo_index, 4);
        assert!(!offer.has_want());
    }

    #[test]
    fn rejects_malformed_outputs() {
        // Wrong protocol tag
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(*b"XSWP")
            .push_slice([2u8])
            .into_script();
        assert!(parse_swap_offer(&script, 1).is_none());

        // Not an OP_RETURN output at all
        let script = Builder::new().push_slice(*b"RSWP").into_script();
        assert!(parse_swap_offer(&script, 1).is_none());

        // Missing signature (single remaining push)
        let script = v2_script(0, [0x11; 32], None, [0xAA; 32], &[1], &[&[0x01]]);
        assert!(parse_swap_offer(&script, 1).is_none());

        // Non-push opcode in the tail
        let script = v2_script(0, [0x11; 32], None, [0xAA; 32], &[1], &[&[0x01], &[0x02]])
            .into_builder_append();
        assert!(parse_swap_offer(&script, 1).is_none());

        // Truncated token id
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(*b"RSWP")
            .push_slice([2u8])
            .push_slice([0u8])
            .push_slice([0u8])
            .push_slice([0u8])
            .push_slice([0x11; 16])
            .into_script();
        assert!(parse_swap_offer(&script, 1).is_none());
    }

    // Helper to splice a non-push opcode onto an existing script's tail.
    trait AppendOp {
        fn into_builder_append(self) -> bitcoin::ScriptBuf;
    }

    impl AppendOp for bitcoin::ScriptBuf {
        fn into_builder_append(self) -> bitcoin::ScriptBuf {
            let mut bytes = self.into_bytes();
            bytes.push(OP_DUP.to_u8());
            bitcoin::ScriptBuf::from_bytes(bytes)
        }
    }

    #[test]
    fn index_script_number_rejects_oversize() {
        let script = v2_script(
            0,
            [0x11; 32],
            None,
            [0xAA; 32],
            &[1, 0, 0, 0, 0], // five bytes
            &[&[0x01], &[0x02]],
        );
        assert!(parse_swap_offer(&script, 1).is_none());
    }
}
