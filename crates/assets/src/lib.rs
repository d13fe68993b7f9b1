//! Artifact references and the guarded file server behind `/api/assets`.

pub mod content_type;
pub mod normalize;
pub mod resolver;

pub use normalize::{
    decode_reference, to_absolute_url, to_client_reference, with_cache_buster, ArtifactReference,
    ASSET_ROUTE,
};
pub use resolver::{Asset, AssetError, AssetResolver, ResolvedAsset, DEFAULT_ALLOWED_DIRS};
