//! Fixed frame preambles and length-prefixed frame detection.
//!
//! Every message starts with a little-endian `u32` that counts the preamble
//! plus the header block (the optional payload follows with its own `u32`
//! length prefix):
//!
//! ```text
//! request:  [length u32][resourceType u16][operationType u16][activityId 16B][tokens ...][payloadLen u32][payload]
//! response: [length u32][status u32]      [activityId 16B]                   [tokens ...][payloadLen u32][payload]
//! ```
//!
//! Replicas write the response status as a full `u32`.  It is read at that
//! width and narrowed to the `u16` HTTP-style code; anything wider is a
//! corrupted frame.

use {
    crate::error::{Result, TransportError},
    bytes::{Buf, BufMut, BytesMut},
    uuid::Uuid,
};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = $id:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn id(self) -> u16 {
                match self {
                    $(Self::$variant => $id),+
                }
            }

            pub fn from_id(id: u16) -> Result<Self> {
                match id {
                    $($id => Ok(Self::$variant),)+
                    other => Err(TransportError::CorruptedFrame(format!(
                        concat!("unknown ", stringify!($name), " 0x{:04x}"),
                        other
                    ))),
                }
            }
        }
    };
}

wire_enum! {
    /// Operation carried by a request frame.
    pub enum OperationType {
        Connection = 0x0000,
        Create = 0x0001,
        Update = 0x0002,
        Read = 0x0003,
        ReadFeed = 0x0004,
        Delete = 0x0005,
        Replace = 0x0006,
        ExecuteJavaScript = 0x0008,
        SqlQuery = 0x0009,
        Pause = 0x000A,
        Resume = 0x000B,
        Stop = 0x000C,
        Recycle = 0x000D,
        Crash = 0x000E,
        Query = 0x000F,
        ForceConfigRefresh = 0x0010,
        Head = 0x0011,
        HeadFeed = 0x0012,
        Upsert = 0x0013,
        Recreate = 0x0014,
        Throttle = 0x0015,
        GetSplitPoint = 0x0016,
        PreCreateValidation = 0x0017,
        BatchApply = 0x0018,
        AbortSplit = 0x0019,
        CompleteSplit = 0x001A,
        OfferUpdateOperation = 0x001B,
        OfferPreGrowValidation = 0x001C,
        BatchReportThroughputUtilization = 0x001D,
        CompletePartitionMigration = 0x001E,
        AbortPartitionMigration = 0x001F,
        PreReplaceValidation = 0x0020,
        AddComputeGatewayRequestCharges = 0x0021,
        MigratePartition = 0x0022,
        Batch = 0x0025,
    }
}

wire_enum! {
    /// Resource addressed by a request frame.
    pub enum ResourceType {
        Connection = 0x0000,
        Database = 0x0001,
        Collection = 0x0002,
        Document = 0x0003,
        Attachment = 0x0004,
        User = 0x0005,
        Permission = 0x0006,
        StoredProcedure = 0x0007,
        Conflict = 0x0008,
        Trigger = 0x0009,
        UserDefinedFunction = 0x000A,
        Module = 0x000B,
        Replica = 0x000C,
        ModuleCommand = 0x000D,
        Record = 0x000E,
        Offer = 0x000F,
        PartitionSetInformation = 0x0010,
        XpReplicatorAddress = 0x0011,
        MasterPartition = 0x0012,
        ServerPartition = 0x0013,
        DatabaseAccount = 0x0014,
        Topology = 0x0015,
        PartitionKeyRange = 0x0016,
        Schema = 0x0018,
        BatchApply = 0x0019,
        RestoreMetadata = 0x001A,
        ComputeGatewayCharges = 0x001B,
        RidRange = 0x001C,
        UserDefinedType = 0x001D,
        ClientEncryptionKey = 0x0021,
    }
}

/// Preamble of a request (and of the context negotiation request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    pub activity_id: Uuid,
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
}

impl RequestFrame {
    /// Length prefix plus the fixed fields.
    pub const LENGTH: usize = 4 + 2 + 2 + 16;

    pub fn new(
        activity_id: Uuid,
        operation_type: OperationType,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            activity_id,
            operation_type,
            resource_type,
        }
    }

    /// Writes the fixed fields. The caller writes the length prefix because
    /// it depends on the header block that follows.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u16_le(self.resource_type.id());
        out.put_u16_le(self.operation_type.id());
        out.put_slice(&self.activity_id.to_bytes_le());
    }

    /// Reads the fixed fields following an already consumed length prefix.
    pub fn decode(input: &mut impl Buf) -> Result<Self> {
        if input.remaining() < Self::LENGTH.saturating_sub(4) {
            return Err(TransportError::CorruptedFrame(
                "truncated request frame".to_string(),
            ));
        }
        let resource_type = ResourceType::from_id(input.get_u16_le())?;
        let operation_type = OperationType::from_id(input.get_u16_le())?;
        let mut raw = [0u8; 16];
        input.copy_to_slice(&mut raw);
        Ok(Self {
            activity_id: Uuid::from_bytes_le(raw),
            operation_type,
            resource_type,
        })
    }
}

/// Preamble of a response (and of the context negotiation response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseStatus {
    /// Preamble plus header block, excluding any payload.
    pub length: u32,
    pub status: u16,
    pub activity_id: Uuid,
}

impl ResponseStatus {
    pub const LENGTH: usize = 4 + 4 + 16;

    pub fn headers_length(&self) -> usize {
        (self.length as usize).saturating_sub(Self::LENGTH)
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.length);
        out.put_u32_le(u32::from(self.status));
        out.put_slice(&self.activity_id.to_bytes_le());
    }

    /// Reads a complete preamble, length prefix included.
    pub fn decode(input: &mut impl Buf) -> Result<Self> {
        if input.remaining() < Self::LENGTH {
            return Err(TransportError::CorruptedFrame(
                "truncated response status".to_string(),
            ));
        }
        let length = input.get_u32_le();
        let status = input.get_u32_le();
        let status = u16::try_from(status).map_err(|_| {
            TransportError::CorruptedFrame(format!("status code {status} out of range"))
        })?;
        let mut raw = [0u8; 16];
        input.copy_to_slice(&mut raw);
        Ok(Self {
            length,
            status,
            activity_id: Uuid::from_bytes_le(raw),
        })
    }
}

/// Decides whether a read buffer holds a complete frame.
///
/// Both checks answer `Ok(false)` when more bytes are needed and fail when
/// the declared length can never be valid, so a reader never waits on a
/// corrupted stream.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    max_frame_length: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self {
            max_frame_length: i32::MAX as usize,
        }
    }
}

impl Framer {
    /// Smallest declared length that can hold a preamble.
    pub const MIN_FRAME_LENGTH: usize = ResponseStatus::LENGTH;

    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: max_frame_length.min(i32::MAX as usize),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Declared length of the frame at the front of `buffer`, once the
    /// preamble is present.
    pub fn declared_length(&self, buffer: &[u8]) -> Result<Option<usize>> {
        if buffer.len() < Self::MIN_FRAME_LENGTH {
            return Ok(None);
        }
        let length = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if length > self.max_frame_length {
            return Err(TransportError::CorruptedFrame(format!(
                "frame length {length} exceeds maximum {}",
                self.max_frame_length
            )));
        }
        if length < Self::MIN_FRAME_LENGTH {
            return Err(TransportError::CorruptedFrame(format!(
                "frame length {length} is below the {} byte minimum",
                Self::MIN_FRAME_LENGTH
            )));
        }
        Ok(Some(length))
    }

    pub fn can_decode_head(&self, buffer: &[u8]) -> Result<bool> {
        Ok(self
            .declared_length(buffer)?
            .is_some_and(|length| length <= buffer.len()))
    }

    /// Whether the `u32`-prefixed payload starting at `start` has fully
    /// arrived.
    pub fn can_decode_payload(&self, buffer: &[u8], start: usize) -> Result<bool> {
        let Some(prefix) = buffer.get(start..start.saturating_add(4)) else {
            return Ok(false);
        };
        let length = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if length > self.max_frame_length {
            return Err(TransportError::CorruptedFrame(format!(
                "payload length {length} exceeds maximum {}",
                self.max_frame_length
            )));
        }
        Ok(start.saturating_add(4).saturating_add(length) <= buffer.len())
    }
}
