//! Conversion of raw ECDSA signatures returned by PKCS #11 tokens into the ASN.1 form X.509
//! structures carry.

/// Length of a raw P-256 ECDSA signature, `r || s`.
pub const RAW_SIGNATURE_LEN: usize = 64;

/// Upper bound of a DER-encoded P-256 ECDSA signature, including the outer tag and length.
pub const MAX_DER_SIGNATURE_LEN: usize = 72;

const COMPONENT_LEN: usize = RAW_SIGNATURE_LEN / 2;

/// Sequence length of two 32-byte positive INTEGERs, each with its tag and length byte.
const MIN_SEQUENCE_LEN: u8 = 0x44;

const SEQUENCE_TAG: u8 = 0x30;
const INTEGER_TAG: u8 = 0x02;

/// Encodes a raw signature `r || s` as `SEQUENCE { INTEGER r, INTEGER s }` into `out`.
///
/// Each component is copied at its full 32-byte width and prefixed by a zero byte if its high
/// bit is set, so the sequence length is 0x44, 0x45 or 0x46 and the encoding 70, 71 or 72
/// bytes long. Returns the number of bytes written.
pub fn format_asn1_ecdsa_signature(
    raw: &[u8; RAW_SIGNATURE_LEN],
    out: &mut [u8; MAX_DER_SIGNATURE_LEN],
) -> usize {
    out[0] = SEQUENCE_TAG;
    out[1] = MIN_SEQUENCE_LEN;

    let mut pos = 2;
    for component in raw.chunks_exact(COMPONENT_LEN) {
        out[pos] = INTEGER_TAG;
        if component[0] & 0x80 != 0 {
            // keep the integer positive
            out[1] += 1;
            out[pos + 1] = COMPONENT_LEN as u8 + 1;
            out[pos + 2] = 0x00;
            pos += 3;
        } else {
            out[pos + 1] = COMPONENT_LEN as u8;
            pos += 2;
        }
        out[pos..pos + COMPONENT_LEN].copy_from_slice(component);
        pos += COMPONENT_LEN;
    }

    usize::from(out[1]) + 2
}
