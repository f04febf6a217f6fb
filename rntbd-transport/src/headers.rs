//! Header schemas of the four token-stream kinds on the wire.
//!
//! | Schema                 | Carried by                         |
//! |------------------------|------------------------------------|
//! | [`ContextRequestHeader`] | the negotiation request          |
//! | [`ContextHeader`]        | the negotiation response         |
//! | [`RequestHeader`]        | every application request        |
//! | [`ResponseHeader`]       | every application response       |
//!
//! Ids and wire types are fixed by the server and must not change.

use crate::token::{Header, TokenType};

macro_rules! define_headers {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = ($id:literal, $token_type:ident, $required:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];
        }

        impl Header for $name {
            fn id(self) -> u16 {
                match self {
                    $(Self::$variant => $id),+
                }
            }

            fn token_type(self) -> TokenType {
                match self {
                    $(Self::$variant => TokenType::$token_type),+
                }
            }

            fn is_required(self) -> bool {
                match self {
                    $(Self::$variant => $required),+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }

            fn from_id(id: u16) -> Option<Self> {
                match id {
                    $($id => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn all() -> &'static [Self] {
                Self::ALL
            }
        }
    };
}

define_headers! {
    /// Headers of the context negotiation request.
    pub enum ContextRequestHeader {
        ProtocolVersion = (0x0000, ULong, true),
        ClientVersion = (0x0001, SmallString, true),
        UserAgent = (0x0002, SmallString, true),
    }
}

define_headers! {
    /// Headers of the context negotiation response.
    pub enum ContextHeader {
        ProtocolVersion = (0x0000, ULong, false),
        ClientVersion = (0x0001, SmallString, false),
        ServerAgent = (0x0002, SmallString, true),
        ServerVersion = (0x0003, SmallString, true),
        IdleTimeoutInSeconds = (0x0004, ULong, false),
        UnauthenticatedTimeoutInSeconds = (0x0005, ULong, false),
    }
}

define_headers! {
    /// Headers of an application request.
    pub enum RequestHeader {
        ResourceId = (0x0000, Bytes, false),
        AuthorizationToken = (0x0001, String, false),
        PayloadPresent = (0x0002, Byte, true),
        Date = (0x0003, SmallString, false),
        PageSize = (0x0004, ULong, false),
        SessionToken = (0x0005, String, false),
        ContinuationToken = (0x0006, String, false),
        IndexingDirective = (0x0007, Byte, false),
        Match = (0x0008, String, false),
        PreTriggerInclude = (0x0009, String, false),
        PostTriggerInclude = (0x000A, String, false),
        IsFanout = (0x000B, Byte, false),
        CollectionPartitionIndex = (0x000C, ULong, false),
        CollectionServiceIndex = (0x000D, ULong, false),
        PreTriggerExclude = (0x000E, String, false),
        PostTriggerExclude = (0x000F, String, false),
        ConsistencyLevel = (0x0010, Byte, false),
        EntityId = (0x0011, String, false),
        ResourceSchemaName = (0x0012, SmallString, false),
        ReplicaPath = (0x0013, String, true),
        ResourceTokenExpiry = (0x0014, ULong, false),
        DatabaseName = (0x0015, String, false),
        CollectionName = (0x0016, String, false),
        DocumentName = (0x0017, String, false),
        AttachmentName = (0x0018, String, false),
        UserName = (0x0019, String, false),
        PermissionName = (0x001A, String, false),
        StoredProcedureName = (0x001B, String, false),
        UserDefinedFunctionName = (0x001C, String, false),
        TriggerName = (0x001D, String, false),
        EnableScanInQuery = (0x001E, Byte, false),
        EmitVerboseTracesInQuery = (0x001F, Byte, false),
        ConflictName = (0x0020, String, false),
        BindReplicaDirective = (0x0021, String, false),
        PrimaryMasterKey = (0x0022, String, false),
        SecondaryMasterKey = (0x0023, String, false),
        PrimaryReadonlyKey = (0x0024, String, false),
        SecondaryReadonlyKey = (0x0025, String, false),
        ProfileRequest = (0x0026, Byte, false),
        EnableLowPrecisionOrderBy = (0x0027, Byte, false),
        ClientVersion = (0x0028, SmallString, false),
        CanCharge = (0x0029, Byte, false),
        CanThrottle = (0x002A, Byte, false),
        PartitionKey = (0x002B, String, false),
        PartitionKeyRangeId = (0x002C, String, false),
        MigrateCollectionDirective = (0x0031, Byte, false),
        SupportSpatialLegacyCoordinates = (0x0033, Byte, false),
        PartitionCount = (0x0034, ULong, false),
        CollectionRid = (0x0035, String, false),
        PartitionKeyRangeName = (0x0036, String, false),
        SchemaName = (0x003A, String, false),
        FilterBySchemaRid = (0x003B, String, false),
        UsePolygonsSmallerThanAHemisphere = (0x003C, Byte, false),
        GatewaySignature = (0x003D, String, false),
        EnableLogging = (0x003E, Byte, false),
        AIm = (0x003F, String, false),
        PopulateQuotaInfo = (0x0040, Byte, false),
        DisableRuPerMinuteUsage = (0x0041, Byte, false),
        PopulateQueryMetrics = (0x0042, Byte, false),
        ResponseContinuationTokenLimitInKb = (0x0043, ULong, false),
        PopulatePartitionStatistics = (0x0044, Byte, false),
        RemoteStorageType = (0x0045, Byte, false),
        CollectionRemoteStorageSecurityIdentifier = (0x0046, String, false),
        IfModifiedSince = (0x0047, String, false),
        PopulateCollectionThroughputInfo = (0x0048, Byte, false),
        RemainingTimeInMsOnClientRequest = (0x0049, ULong, false),
        ClientRetryAttemptCount = (0x004A, ULong, false),
        TargetLsn = (0x004B, LongLong, false),
        TargetGlobalCommittedLsn = (0x004C, LongLong, false),
        TransportRequestId = (0x004D, ULong, false),
        RestoreMetadataFilter = (0x004E, String, false),
        RestoreParams = (0x004F, Bytes, false),
        ShareThroughput = (0x0050, Byte, false),
        PartitionResourceFilter = (0x0051, String, false),
        IsReadOnlyScript = (0x0052, Byte, false),
        IsAutoScaleRequest = (0x0053, Byte, false),
        ForceQueryScan = (0x0054, Byte, false),
        CanOfferReplaceComplete = (0x0056, Byte, false),
        ExcludeSystemProperties = (0x0057, Byte, false),
        BinaryId = (0x0058, Bytes, false),
        TimeToLiveInSeconds = (0x0059, Long, false),
        EffectivePartitionKey = (0x005A, Bytes, false),
        BinaryPassthroughRequest = (0x005B, Byte, false),
        UserDefinedTypeName = (0x005C, String, false),
        EnableDynamicRidRangeAllocation = (0x005D, Byte, false),
        EnumerationDirection = (0x005E, Byte, false),
        StartId = (0x005F, Bytes, false),
        EndId = (0x0060, Bytes, false),
        FanoutOperationState = (0x0061, Byte, false),
        StartEpk = (0x0062, Bytes, false),
        EndEpk = (0x0063, Bytes, false),
        ReadFeedKeyType = (0x0064, Byte, false),
        ContentSerializationFormat = (0x0065, Byte, false),
        AllowTentativeWrites = (0x0066, Byte, false),
        IsUserRequest = (0x0067, Byte, false),
        SharedOfferThroughput = (0x0068, ULong, false),
    }
}

define_headers! {
    /// Headers of an application response.
    pub enum ResponseHeader {
        PayloadPresent = (0x0000, Byte, true),
        LastStateChangeDateTime = (0x0002, SmallString, false),
        ContinuationToken = (0x0003, String, false),
        ETag = (0x0004, String, false),
        ReadsPerformed = (0x0007, ULong, false),
        WritesPerformed = (0x0008, ULong, false),
        QueriesPerformed = (0x0009, ULong, false),
        IndexTermsGenerated = (0x000A, ULong, false),
        ScriptsExecuted = (0x000B, ULong, false),
        RetryAfterMilliseconds = (0x000C, ULong, false),
        IndexingDirective = (0x000D, Byte, false),
        StorageMaxResourceQuota = (0x000E, String, false),
        StorageResourceQuotaUsage = (0x000F, String, false),
        SchemaVersion = (0x0010, SmallString, false),
        CollectionPartitionIndex = (0x0011, ULong, false),
        CollectionServiceIndex = (0x0012, ULong, false),
        Lsn = (0x0013, LongLong, false),
        ItemCount = (0x0014, ULong, false),
        RequestCharge = (0x0015, Double, false),
        OwnerFullName = (0x0017, String, false),
        OwnerId = (0x0018, String, false),
        DatabaseAccountId = (0x0019, String, false),
        QuorumAckedLsn = (0x001A, LongLong, false),
        RequestValidationFailure = (0x001B, Byte, false),
        SubStatus = (0x001C, ULong, false),
        CollectionUpdateProgress = (0x001D, ULong, false),
        CurrentWriteQuorum = (0x001E, ULong, false),
        CurrentReplicaSetSize = (0x001F, ULong, false),
        CollectionLazyIndexProgress = (0x0020, ULong, false),
        PartitionKeyRangeId = (0x0021, String, false),
        LogResults = (0x0025, String, false),
        XpRole = (0x0026, ULong, false),
        IsRuPerMinuteUsed = (0x0027, Byte, false),
        QueryMetrics = (0x0028, String, false),
        GlobalCommittedLsn = (0x0029, LongLong, false),
        NumberOfReadRegions = (0x0030, ULong, false),
        OfferReplacePending = (0x0031, Byte, false),
        ItemLsn = (0x0032, LongLong, false),
        RestoreState = (0x0033, String, false),
        CollectionSecurityIdentifier = (0x0034, String, false),
        TransportRequestId = (0x0035, ULong, false),
        ShareThroughput = (0x0036, Byte, false),
        DisableRntbdChannel = (0x0038, Byte, false),
        ServerDateTimeUtc = (0x0039, SmallString, false),
        LocalLsn = (0x003A, LongLong, false),
        QuorumAckedLocalLsn = (0x003B, LongLong, false),
        ItemLocalLsn = (0x003C, LongLong, false),
        HasTentativeWrites = (0x003D, Byte, false),
        SessionToken = (0x003E, String, false),
        ReplicatorLsnToGlsnDelta = (0x003F, ULong, false),
        ReplicatorLsnToLlsnDelta = (0x0040, ULong, false),
        VectorClockLocalProgress = (0x0041, ULongLong, false),
        MinimumRusForOffer = (0x0042, ULong, false),
        XpConfigurationSessionsCount = (0x0043, ULong, false),
        IndexUtilization = (0x0044, String, false),
        QueryExecutionInfo = (0x0045, String, false),
        UnflushedMergeLogEntryCount = (0x0046, ULong, false),
        ResourceName = (0x0047, String, false),
        TimeToLiveInSeconds = (0x0048, Long, false),
        ReplicaStatusRevoked = (0x0049, Byte, false),
        SoftMaxAllowedThroughput = (0x0050, ULong, false),
        BackendRequestDurationMilliseconds = (0x0051, Double, false),
    }
}

/// HTTP-style header names used on [`crate::message::ServiceRequest`] and
/// [`crate::message::StoreResponse`] maps.
pub mod http {
    pub const ACTIVITY_ID: &str = "x-ms-activity-id";
    pub const AUTHORIZATION: &str = "authorization";
    pub const A_IM: &str = "a-im";
    pub const ALLOW_TENTATIVE_WRITES: &str = "x-ms-cosmos-allow-tentative-writes";
    pub const CLIENT_RETRY_ATTEMPT_COUNT: &str = "x-ms-client-retry-attempt-count";
    pub const COLLECTION_RID: &str = "x-ms-collection-rid";
    pub const CONSISTENCY_LEVEL: &str = "x-ms-consistency-level";
    pub const CONTINUATION: &str = "x-ms-continuation";
    pub const CURRENT_REPLICA_SET_SIZE: &str = "x-ms-current-replica-set-size";
    pub const CURRENT_WRITE_QUORUM: &str = "x-ms-current-write-quorum";
    pub const DATE: &str = "x-ms-date";
    pub const ENABLE_SCAN_IN_QUERY: &str = "x-ms-documentdb-query-enablescan";
    pub const ETAG: &str = "etag";
    pub const GLOBAL_COMMITTED_LSN: &str = "x-ms-global-committed-lsn";
    pub const HAS_TENTATIVE_WRITES: &str = "x-ms-cosmosdb-has-tentative-writes";
    pub const IF_MATCH: &str = "if-match";
    pub const IF_MODIFIED_SINCE: &str = "if-modified-since";
    pub const IF_NONE_MATCH: &str = "if-none-match";
    pub const INDEX_UTILIZATION: &str = "x-ms-cosmos-index-utilization";
    pub const INDEXING_DIRECTIVE: &str = "x-ms-indexing-directive";
    pub const ITEM_COUNT: &str = "x-ms-item-count";
    pub const ITEM_LSN: &str = "x-ms-item-lsn";
    pub const LAST_STATE_CHANGE_UTC: &str = "x-ms-last-state-change-utc";
    pub const LOCAL_LSN: &str = "x-ms-cosmos-llsn";
    pub const LOG_RESULTS: &str = "x-ms-documentdb-script-log-results";
    pub const LSN: &str = "lsn";
    pub const MAX_ITEM_COUNT: &str = "x-ms-max-item-count";
    pub const NUMBER_OF_READ_REGIONS: &str = "x-ms-number-of-read-regions";
    pub const OWNER_FULL_NAME: &str = "x-ms-alt-content-path";
    pub const OWNER_ID: &str = "x-ms-content-path";
    pub const PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";
    pub const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";
    pub const POPULATE_QUERY_METRICS: &str = "x-ms-documentdb-populatequerymetrics";
    pub const POPULATE_QUOTA_INFO: &str = "x-ms-documentdb-populatequotainfo";
    pub const POST_TRIGGER_INCLUDE: &str = "x-ms-documentdb-post-trigger-include";
    pub const PRE_TRIGGER_INCLUDE: &str = "x-ms-documentdb-pre-trigger-include";
    pub const QUERY_METRICS: &str = "x-ms-documentdb-query-metrics";
    pub const QUORUM_ACKED_LOCAL_LSN: &str = "x-ms-cosmos-quorum-acked-llsn";
    pub const QUORUM_ACKED_LSN: &str = "x-ms-quorum-acked-lsn";
    pub const REMAINING_TIME_IN_MS_ON_CLIENT: &str = "x-ms-remaining-time-in-ms-on-client";
    pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
    pub const REQUEST_DURATION_MS: &str = "x-ms-request-duration-ms";
    pub const RESOURCE_QUOTA: &str = "x-ms-resource-quota";
    pub const RESOURCE_USAGE: &str = "x-ms-resource-usage";
    pub const RESPONSE_CONTINUATION_TOKEN_LIMIT_IN_KB: &str =
        "x-ms-documentdb-responsecontinuationtokenlimitinkb";
    pub const RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";
    pub const SCHEMA_VERSION: &str = "x-ms-schemaversion";
    pub const SERVER_DATE_UTC: &str = "x-ms-server-date-utc";
    pub const SESSION_TOKEN: &str = "x-ms-session-token";
    pub const SUB_STATUS: &str = "x-ms-substatus";
    pub const TARGET_GLOBAL_COMMITTED_LSN: &str = "x-ms-target-global-committed-lsn";
    pub const TARGET_LSN: &str = "x-ms-target-lsn";
    pub const TRANSPORT_REQUEST_ID: &str = "x-ms-transport-request-id";
    pub const VERSION: &str = "x-ms-version";
    pub const XP_ROLE: &str = "x-ms-xp-role";
}

impl ResponseHeader {
    /// HTTP-style name used when exposing this header on a response map.
    pub fn http_name(self) -> Option<&'static str> {
        Some(match self {
            Self::ContinuationToken => http::CONTINUATION,
            Self::ETag => http::ETAG,
            Self::ItemCount => http::ITEM_COUNT,
            Self::Lsn => http::LSN,
            Self::RequestCharge => http::REQUEST_CHARGE,
            Self::RetryAfterMilliseconds => http::RETRY_AFTER_MS,
            Self::SessionToken => http::SESSION_TOKEN,
            Self::SubStatus => http::SUB_STATUS,
            Self::PartitionKeyRangeId => http::PARTITION_KEY_RANGE_ID,
            Self::GlobalCommittedLsn => http::GLOBAL_COMMITTED_LSN,
            Self::ItemLsn => http::ITEM_LSN,
            Self::LocalLsn => http::LOCAL_LSN,
            Self::QuorumAckedLsn => http::QUORUM_ACKED_LSN,
            Self::QuorumAckedLocalLsn => http::QUORUM_ACKED_LOCAL_LSN,
            Self::CurrentWriteQuorum => http::CURRENT_WRITE_QUORUM,
            Self::CurrentReplicaSetSize => http::CURRENT_REPLICA_SET_SIZE,
            Self::NumberOfReadRegions => http::NUMBER_OF_READ_REGIONS,
            Self::OwnerFullName => http::OWNER_FULL_NAME,
            Self::OwnerId => http::OWNER_ID,
            Self::SchemaVersion => http::SCHEMA_VERSION,
            Self::ServerDateTimeUtc => http::SERVER_DATE_UTC,
            Self::TransportRequestId => http::TRANSPORT_REQUEST_ID,
            Self::LastStateChangeDateTime => http::LAST_STATE_CHANGE_UTC,
            Self::LogResults => http::LOG_RESULTS,
            Self::QueryMetrics => http::QUERY_METRICS,
            Self::IndexUtilization => http::INDEX_UTILIZATION,
            Self::BackendRequestDurationMilliseconds => http::REQUEST_DURATION_MS,
            Self::StorageMaxResourceQuota => http::RESOURCE_QUOTA,
            Self::StorageResourceQuotaUsage => http::RESOURCE_USAGE,
            Self::HasTentativeWrites => http::HAS_TENTATIVE_WRITES,
            Self::XpRole => http::XP_ROLE,
            _ => return None,
        })
    }

    /// Headers whose byte value is a flag rather than a number.
    pub fn is_flag(self) -> bool {
        matches!(
            self,
            Self::HasTentativeWrites
                | Self::IsRuPerMinuteUsed
                | Self::OfferReplacePending
                | Self::ShareThroughput
                | Self::DisableRntbdChannel
                | Self::ReplicaStatusRevoked
                | Self::RequestValidationFailure
        )
    }
}
