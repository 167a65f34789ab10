//! Python functions executed on the board.
//!
//! Each [`RemoteFn`] is a self-contained function definition. A call is
//! rendered by [`Payload`](crate::Payload), which substitutes placeholders
//! and appends the invocation.

/// A remote function: its name and full Python definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFn {
    /// Function name, used to build the call expression.
    pub name: &'static str,
    /// Python source, starting with `def {name}(`.
    pub source: &'static str,
}

macro_rules! remote_fn {
    ($(#[$doc:meta])* $ident:ident, $name:literal) => {
        $(#[$doc])*
        pub const $ident: RemoteFn = RemoteFn {
            name: $name,
            source: include_str!(concat!("ops/", $name, ".py")),
        };
    };
}

remote_fn!(
    /// `board_name(default)`: repr of `board.name`, or of `default`.
    BOARD_NAME,
    "board_name"
);
remote_fn!(
    /// `test_buffer()`: whether `sys.stdin.buffer` exists.
    TEST_BUFFER,
    "test_buffer"
);
remote_fn!(
    /// `listdir(dirname)`: entry names, or `None`.
    LISTDIR,
    "listdir"
);
remote_fn!(
    /// `listdir_stat(dirname)`: `[(name, stat_tuple), …]` in unix time, or `None`.
    LISTDIR_STAT,
    "listdir_stat"
);
remote_fn!(
    /// `get_stat(filename)`: stat tuple in unix time, or `None`.
    GET_STAT,
    "get_stat"
);
remote_fn!(
    /// `make_directory(dirname)`: `True` on success.
    MAKE_DIRECTORY,
    "make_directory"
);
remote_fn!(
    /// `remove_file(filename, recursive=False, force=False)`: `True` on success.
    REMOVE_FILE,
    "remove_file"
);
remote_fn!(
    /// `recv_file_from_host(src_file, dst_filename, filesize, dst_mode='wb')`.
    ///
    /// Board side of an upload; the host streams frames through the side channel.
    RECV_FILE_FROM_HOST,
    "recv_file_from_host"
);
remote_fn!(
    /// `send_file_to_host(src_filename, dst_file, filesize)`.
    ///
    /// Board side of a download; the host acknowledges every frame.
    SEND_FILE_TO_HOST,
    "send_file_to_host"
);
remote_fn!(
    /// `set_time(year, month, day, hour, minute, second)`: sets the RTC.
    SET_TIME,
    "set_time"
);
remote_fn!(
    /// `get_time()`: `time.localtime()` tuple.
    GET_TIME,
    "get_time"
);
remote_fn!(
    /// `get_ip_address()`: repr of the station IP address, or `None`.
    GET_IP_ADDRESS,
    "get_ip_address"
);
remote_fn!(
    /// `get_mac_address()`: repr of the station MAC address, or `None`.
    GET_MAC_ADDRESS,
    "get_mac_address"
);

/// Every remote function, for lookups by name.
pub const ALL: &[RemoteFn] = &[
    BOARD_NAME,
    TEST_BUFFER,
    LISTDIR,
    LISTDIR_STAT,
    GET_STAT,
    MAKE_DIRECTORY,
    REMOVE_FILE,
    RECV_FILE_FROM_HOST,
    SEND_FILE_TO_HOST,
    SET_TIME,
    GET_TIME,
    GET_IP_ADDRESS,
    GET_MAC_ADDRESS,
];

/// Finds a remote function by name.
pub fn find(name: &str) -> Option<&'static RemoteFn> {
    ALL.iter().find(|f| f.name == name)
}
