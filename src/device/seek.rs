use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Prefix marking a packet as a positional seek command rather than log data.
pub const SEEK_COMMAND_PREFIX: &str = "AESDCHAR_IOCSEEKTO:";

/// Argument of the positional seek control operation.
///
/// `#[repr(C)]` with native-endian fields: the same definition serves both
/// sides of the ioctl-style boundary and must stay layout-stable across
/// producers and consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SeekTo {
    /// Index of the target command, counted from the oldest present one.
    pub write_cmd: u32,
    /// Byte offset within that command.
    pub write_cmd_offset: u32,
}

/// Parse the textual form `AESDCHAR_IOCSEEKTO:X,Y` (decimal, one comma).
///
/// A trailing newline is accepted. Returns `None` for anything else; such a
/// packet is ordinary log data.
pub fn parse_seek_command(packet: &[u8]) -> Option<SeekTo> {
    let text = std::str::from_utf8(packet).ok()?;
    let rest = text.strip_prefix(SEEK_COMMAND_PREFIX)?;
    let rest = rest.strip_suffix('\n').unwrap_or(rest);
    let (cmd, offset) = rest.split_once(',')?;
    Some(SeekTo {
        write_cmd: cmd.parse().ok()?,
        write_cmd_offset: offset.parse().ok()?,
    })
}
