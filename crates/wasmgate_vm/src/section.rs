//! Custom section lookup in WASM binaries.

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const CUSTOM_SECTION_ID: u8 = 0;

/// Read an unsigned LEB128 u32, returning the value and bytes consumed
fn read_leb128_u32(bytes: &[u8]) -> Option<(u32, usize)> {
    let mut result = 0u32;
    let mut shift = 0;

    for (pos, &byte) in bytes.iter().enumerate() {
        result |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some((result, pos + 1));
        }
        shift += 7;
        if shift >= 35 {
            return None;
        }
    }
    None
}

/// Return the payload of the first custom section called `name`.
///
/// Malformed binaries yield `None`; validation is the engine's job.
#[must_use]
pub fn custom_section<'a>(code: &'a [u8], name: &str) -> Option<&'a [u8]> {
    if code.len() < 8 || &code[0..4] != WASM_MAGIC {
        return None;
    }

    let mut pos = 8; // magic + version
    while pos < code.len() {
        let section_id = code[pos];
        pos += 1;

        let (size, read) = read_leb128_u32(code.get(pos..)?)?;
        pos += read;
        let end = pos.checked_add(size as usize)?;
        let section = code.get(pos..end)?;

        if section_id == CUSTOM_SECTION_ID {
            let (name_len, read) = read_leb128_u32(section)?;
            let name_end = read.checked_add(name_len as usize)?;
            let section_name = section.get(read..name_end)?;
            if section_name == name.as_bytes() {
                return section.get(name_end..);
            }
        }
        pos = end;
    }
    None
}

#[cfg(test)]
pub(crate) fn append_custom_section(code: &mut Vec<u8>, name: &str, payload: &[u8]) {
    fn write_leb128_u32(out: &mut Vec<u8>, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    let mut body = Vec::new();
    write_leb128_u32(&mut body, name.len() as u32);
    body.extend_from_slice(name.as_bytes());
    body.extend_from_slice(payload);

    code.push(CUSTOM_SECTION_ID);
    write_leb128_u32(code, body.len() as u32);
    code.extend_from_slice(&body);
}
