mod types;

pub use types::{
    ActivateResponse, CapabilitiesResponse, CapabilityScope, CreateRequest, ErrorResponse,
    GetResponse, ListResponse, MountRequest, MountResponse, NameRequest, PathResponse,
    UnmountRequest, VolumeInfo,
};
