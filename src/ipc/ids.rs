//! Bounded identifier spaces of the wire protocol.
//!
//! Object and signal ids travel as raw `u32` on the wire. Anything at or
//! above its bound is rejected by the dispatcher before it touches a table.

/// Number of addressable object slots (exclusive upper bound for object ids).
pub const OBJECT_END: u32 = 11;

/// Exclusive upper bound for command ids within one object.
pub const COMMAND_END: u32 = 64;

/// Number of signal/broadcast slots (shared id space).
pub const SIGNAL_END: u32 = 16;

/// Maximum number of declared arguments per command.
pub const MAX_ARGS: usize = 4;

/// Reserved command ids.
pub mod command {
    /// Successful reply (server → client).
    pub const REPLY: u32 = 0;
    /// Error reply carrying a diagnostic string (server → client).
    pub const ERROR: u32 = 1;
    /// Register for a single-shot signal; also tags signal deliveries.
    pub const SIGNAL: u32 = 2;
    /// Subscribe to a broadcast; also tags broadcast deliveries.
    pub const BROADCAST: u32 = 3;
    /// Drop one broadcast subscription (by cookie).
    pub const BROADCAST_UNREGISTER: u32 = 4;
}

/// Addressable server-side objects.
///
/// `Signal` is the reserved control object: it is never registered, the
/// dispatcher handles it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ObjectId {
    /// Reserved control object for signal/broadcast registration.
    Signal = 0,
    /// Daemon core (hello, quit, stats).
    Main = 1,
    /// Playlist management.
    Playlist = 2,
    /// Configuration values.
    Config = 3,
    /// Playback/output control.
    Output = 4,
    /// Media library.
    Medialib = 5,
    /// Collections.
    Collection = 6,
    /// Visualization data.
    Visualization = 7,
    /// Media info reader.
    MediainfoReader = 8,
    /// Transform chain introspection.
    Xform = 9,
    /// Binary data store.
    Bindata = 10,
}

impl ObjectId {
    /// Every object id, in wire order.
    pub const ALL: [ObjectId; OBJECT_END as usize] = [
        Self::Signal,
        Self::Main,
        Self::Playlist,
        Self::Config,
        Self::Output,
        Self::Medialib,
        Self::Collection,
        Self::Visualization,
        Self::MediainfoReader,
        Self::Xform,
        Self::Bindata,
    ];

    /// Raw wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Slot index into per-object tables.
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Human-readable name used in logs and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Main => "main",
            Self::Playlist => "playlist",
            Self::Config => "config",
            Self::Output => "output",
            Self::Medialib => "medialib",
            Self::Collection => "collection",
            Self::Visualization => "visualization",
            Self::MediainfoReader => "mediainfo_reader",
            Self::Xform => "xform",
            Self::Bindata => "bindata",
        }
    }
}

impl TryFrom<u32> for ObjectId {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        Self::ALL.get(raw as usize).copied().ok_or(raw)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u32())
    }
}

/// Signal and broadcast ids (one shared id space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum SignalId {
    /// Playlist contents changed.
    PlaylistChanged = 0,
    /// A configuration value changed.
    ConfigValueChanged = 1,
    /// Playback status changed (playing/paused/stopped).
    PlaybackStatus = 2,
    /// Output volume changed.
    OutputVolumeChanged = 3,
    /// Current playtime tick.
    OutputPlaytime = 4,
    /// Current entry id changed.
    OutputCurrentId = 5,
    /// Output device failed to open.
    OutputOpenFail = 6,
    /// Current playlist position changed.
    PlaylistCurrentPos = 7,
    /// A playlist was loaded.
    PlaylistLoaded = 8,
    /// Media library entry added.
    MedialibEntryAdded = 9,
    /// Media library entry updated.
    MedialibEntryUpdate = 10,
    /// A collection changed.
    CollectionChanged = 11,
    /// The daemon is quitting.
    Quit = 12,
    /// Media info reader status.
    MediainfoReaderStatus = 13,
    /// Count of unindexed entries.
    MediainfoReaderUnindexed = 14,
    /// Visualization data frame.
    VisualizationData = 15,
}

impl SignalId {
    /// Every signal id, in wire order.
    pub const ALL: [SignalId; SIGNAL_END as usize] = [
        Self::PlaylistChanged,
        Self::ConfigValueChanged,
        Self::PlaybackStatus,
        Self::OutputVolumeChanged,
        Self::OutputPlaytime,
        Self::OutputCurrentId,
        Self::OutputOpenFail,
        Self::PlaylistCurrentPos,
        Self::PlaylistLoaded,
        Self::MedialibEntryAdded,
        Self::MedialibEntryUpdate,
        Self::CollectionChanged,
        Self::Quit,
        Self::MediainfoReaderStatus,
        Self::MediainfoReaderUnindexed,
        Self::VisualizationData,
    ];

    /// Raw wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for SignalId {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        Self::ALL.get(raw as usize).copied().ok_or(raw)
    }
}
