use baclink_datalink::Vmac;

/// Parse a virtual MAC given as `aa:bb:cc` hex octets.
///
/// Used with clap's `value_parser` for tools that take a fixed VMAC.
pub fn parse_vmac(text: &str) -> Result<Vmac, String> {
    let mut octets = [0u8; 3];
    let mut parts = text.split(':');
    for octet in &mut octets {
        let part = parts
            .next()
            .ok_or_else(|| format!("expected aa:bb:cc, got {text:?}"))?;
        *octet =
            u8::from_str_radix(part, 16).map_err(|_| format!("bad hex octet {part:?}"))?;
    }
    if parts.next().is_some() {
        return Err(format!("expected exactly three octets, got {text:?}"));
    }
    Ok(Vmac(octets))
}
