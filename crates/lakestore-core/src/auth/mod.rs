pub mod sigv4;

pub use sigv4::{
    HeaderAuth, PresignedAuth, SigV4Error, SigV4Verifier, SignedRequest, parse_authorization,
    parse_presigned_query,
};
