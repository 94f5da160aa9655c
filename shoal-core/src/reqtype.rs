//! Write-request type classification.
//!
//! The string forms and set memberships here are a wire contract: every node
//! in a cluster must agree on them, as they gate routing, replication and
//! replay. Anything which does not parse as a `WriteReqType` is a read and
//! skips the write pipeline entirely.

use std::fmt;

/// A request type which mutates cluster state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum WriteReqType {
    DocumentsCreate = 1,
    DocumentsDestroy = 2,
    DocumentsUpdate = 3,
    DocumentsUpdateInplace = 4,
    DocumentsSetTopGroupLabel = 5,
    DocumentsLogGroupLabel = 6,
    DocumentsVisit = 7,
    CollectionStartCollection = 8,
    CollectionStopCollection = 9,
    CollectionUpdateCollectionConf = 10,
    CollectionRebuildFromScd = 11,
    CollectionBackupAll = 12,
    CollectionSetKv = 13,
    CollectionUpdateShardingConf = 14,
    CommandsIndex = 15,
    CommandsIndexRecommend = 16,
    CommandsMining = 17,
    CommandsOptimizeIndex = 18,
    CommandsIndexQueryLog = 19,
    FacetedSetCustomRank = 20,
    FacetedSetMerchantScore = 21,
    FacetedSetOntology = 22,
    KeywordsInjectQueryCorrection = 23,
    KeywordsInjectQueryRecommend = 24,
    RecommendAddUser = 25,
    RecommendUpdateUser = 26,
    RecommendRemoveUser = 27,
    RecommendPurchaseItem = 28,
    RecommendRateItem = 29,
    RecommendVisitItem = 30,
    RecommendUpdateShoppingCart = 31,
    RecommendTrackEvent = 32,
}

/// All recognized write request types, in code order.
pub const ALL_WRITE_REQ_TYPES: &[WriteReqType] = &[
    WriteReqType::DocumentsCreate,
    WriteReqType::DocumentsDestroy,
    WriteReqType::DocumentsUpdate,
    WriteReqType::DocumentsUpdateInplace,
    WriteReqType::DocumentsSetTopGroupLabel,
    WriteReqType::DocumentsLogGroupLabel,
    WriteReqType::DocumentsVisit,
    WriteReqType::CollectionStartCollection,
    WriteReqType::CollectionStopCollection,
    WriteReqType::CollectionUpdateCollectionConf,
    WriteReqType::CollectionRebuildFromScd,
    WriteReqType::CollectionBackupAll,
    WriteReqType::CollectionSetKv,
    WriteReqType::CollectionUpdateShardingConf,
    WriteReqType::CommandsIndex,
    WriteReqType::CommandsIndexRecommend,
    WriteReqType::CommandsMining,
    WriteReqType::CommandsOptimizeIndex,
    WriteReqType::CommandsIndexQueryLog,
    WriteReqType::FacetedSetCustomRank,
    WriteReqType::FacetedSetMerchantScore,
    WriteReqType::FacetedSetOntology,
    WriteReqType::KeywordsInjectQueryCorrection,
    WriteReqType::KeywordsInjectQueryRecommend,
    WriteReqType::RecommendAddUser,
    WriteReqType::RecommendUpdateUser,
    WriteReqType::RecommendRemoveUser,
    WriteReqType::RecommendPurchaseItem,
    WriteReqType::RecommendRateItem,
    WriteReqType::RecommendVisitItem,
    WriteReqType::RecommendUpdateShoppingCart,
    WriteReqType::RecommendTrackEvent,
];

impl WriteReqType {
    /// The stable numeric code of this type, recorded in request log heads.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Resolve a type from its stable numeric code.
    pub fn from_code(code: u16) -> Option<Self> {
        ALL_WRITE_REQ_TYPES.iter().copied().find(|t| t.code() == code)
    }

    /// The stable `controller_action` string form of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentsCreate => "documents_create",
            Self::DocumentsDestroy => "documents_destroy",
            Self::DocumentsUpdate => "documents_update",
            Self::DocumentsUpdateInplace => "documents_update_inplace",
            Self::DocumentsSetTopGroupLabel => "documents_set_top_group_label",
            Self::DocumentsLogGroupLabel => "documents_log_group_label",
            Self::DocumentsVisit => "documents_visit",
            Self::CollectionStartCollection => "collection_start_collection",
            Self::CollectionStopCollection => "collection_stop_collection",
            Self::CollectionUpdateCollectionConf => "collection_update_collection_conf",
            Self::CollectionRebuildFromScd => "collection_rebuild_from_scd",
            Self::CollectionBackupAll => "collection_backup_all",
            Self::CollectionSetKv => "collection_set_kv",
            Self::CollectionUpdateShardingConf => "collection_update_sharding_conf",
            Self::CommandsIndex => "commands_index",
            Self::CommandsIndexRecommend => "commands_index_recommend",
            Self::CommandsMining => "commands_mining",
            Self::CommandsOptimizeIndex => "commands_optimize_index",
            Self::CommandsIndexQueryLog => "commands_index_query_log",
            Self::FacetedSetCustomRank => "faceted_set_custom_rank",
            Self::FacetedSetMerchantScore => "faceted_set_merchant_score",
            Self::FacetedSetOntology => "faceted_set_ontology",
            Self::KeywordsInjectQueryCorrection => "keywords_inject_query_correction",
            Self::KeywordsInjectQueryRecommend => "keywords_inject_query_recommend",
            Self::RecommendAddUser => "recommend_add_user",
            Self::RecommendUpdateUser => "recommend_update_user",
            Self::RecommendRemoveUser => "recommend_remove_user",
            Self::RecommendPurchaseItem => "recommend_purchase_item",
            Self::RecommendRateItem => "recommend_rate_item",
            Self::RecommendVisitItem => "recommend_visit_item",
            Self::RecommendUpdateShoppingCart => "recommend_update_shopping_cart",
            Self::RecommendTrackEvent => "recommend_track_event",
        }
    }

    /// Resolve a type from its string form; `None` means the action is not a
    /// write request.
    pub fn parse(val: &str) -> Option<Self> {
        ALL_WRITE_REQ_TYPES.iter().copied().find(|t| t.as_str() == val)
    }

    /// Whether this type is safe to re-execute from the request log during
    /// recovery. Non-replayable types are only ever executed forward.
    pub fn is_replay_safe(&self) -> bool {
        matches!(
            self,
            Self::DocumentsSetTopGroupLabel
                | Self::DocumentsLogGroupLabel
                | Self::DocumentsVisit
                | Self::FacetedSetCustomRank
                | Self::FacetedSetMerchantScore
                | Self::FacetedSetOntology
                | Self::RecommendAddUser
                | Self::RecommendUpdateUser
                | Self::RecommendRemoveUser
                | Self::RecommendPurchaseItem
                | Self::RecommendRateItem
                | Self::RecommendVisitItem
                | Self::RecommendUpdateShoppingCart
                | Self::RecommendTrackEvent
        )
    }

    /// Whether the master auto-distributes this type to every relevant shard.
    /// Other types target only the shards derived from the request itself.
    pub fn is_auto_shard(&self) -> bool {
        matches!(
            self,
            Self::DocumentsSetTopGroupLabel
                | Self::DocumentsLogGroupLabel
                | Self::CommandsMining
                | Self::CommandsOptimizeIndex
                | Self::CommandsIndexQueryLog
                | Self::FacetedSetCustomRank
                | Self::FacetedSetMerchantScore
                | Self::FacetedSetOntology
                | Self::KeywordsInjectQueryCorrection
                | Self::KeywordsInjectQueryRecommend
                | Self::RecommendAddUser
                | Self::RecommendUpdateUser
                | Self::RecommendRemoveUser
                | Self::RecommendPurchaseItem
                | Self::RecommendRateItem
                | Self::RecommendVisitItem
                | Self::RecommendUpdateShoppingCart
                | Self::RecommendTrackEvent
        )
    }
}

impl fmt::Display for WriteReqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
