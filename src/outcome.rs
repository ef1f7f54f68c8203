//! Per-connection result codes. These are errno values narrowed to the
//! 16-bit result field; nothing here is ever process-fatal.

pub const SUCCESS: u16 = 0;
pub const CONN_REFUSED: u16 = libc::ECONNREFUSED as u16;
pub const HOST_UNREACHABLE: u16 = libc::EHOSTUNREACH as u16;
pub const NET_UNREACHABLE: u16 = libc::ENETUNREACH as u16;
pub const TIMED_OUT: u16 = libc::ETIMEDOUT as u16;
pub const CONN_RESET: u16 = libc::ECONNRESET as u16;
pub const ACCESS_DENIED: u16 = libc::EACCES as u16;
pub const IO_ERROR: u16 = libc::EIO as u16;
pub const ADDR_TYPE_UNSUPPORTED: u16 = libc::EAFNOSUPPORT as u16;
pub const COMMAND_UNSUPPORTED: u16 = libc::ENOTSUP as u16;

/// Initial result field of an entry nobody has probed yet.
pub const NOT_ATTEMPTED: u16 = u16::MAX;

/// Narrow an OS error number to the result field.
pub fn from_errno(errno: i32) -> u16 {
    u16::try_from(errno).unwrap_or(IO_ERROR)
}

pub fn from_io_error(err: &std::io::Error) -> u16 {
    err.raw_os_error().map_or(IO_ERROR, from_errno)
}

/// Short label used for metrics and logs.
pub fn label(code: u16) -> &'static str {
    match code {
        SUCCESS => "ok",
        CONN_REFUSED => "refused",
        HOST_UNREACHABLE => "host_unreachable",
        NET_UNREACHABLE => "net_unreachable",
        TIMED_OUT => "timed_out",
        CONN_RESET => "reset",
        ACCESS_DENIED => "access_denied",
        IO_ERROR => "io_error",
        ADDR_TYPE_UNSUPPORTED => "addr_type_unsupported",
        COMMAND_UNSUPPORTED => "command_unsupported",
        NOT_ATTEMPTED => "not_attempted",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_narrowing() {
        assert_eq!(from_errno(libc::ECONNREFUSED), CONN_REFUSED);
        assert_eq!(from_errno(-1), IO_ERROR);
        assert_eq!(from_errno(70_000), IO_ERROR);
        let e = std::io::Error::new(std::io::ErrorKind::Other, "synthetic");
        assert_eq!(from_io_error(&e), IO_ERROR);
    }

    #[test]
    fn labels() {
        assert_eq!(label(SUCCESS), "ok");
        assert_eq!(label(TIMED_OUT), "timed_out");
        assert_eq!(label(4242), "other");
    }
}
