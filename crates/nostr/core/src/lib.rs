pub mod filter;
pub mod keys;
pub mod nip01;
pub mod nip46;
pub mod nip56;
pub mod tag_parsing;

pub use filter::{Filter, FilterError, FilterKey, matches_any};
pub use keys::{Keys, KeysError, load_keys_from_path};
pub use nip01::{
    Event, EventTemplate, Nip01Error, UnsignedEvent, finalize_event, generate_secret_key,
    get_event_hash, get_public_key_hex, is_valid_event, sign_event, unix_now, validate_event,
    verify_event,
};
pub use nip46::{KIND_NOSTR_CONNECT, Nip46Error, SignRequest, SignResponse};
pub use nip56::{KIND_REPORT, Nip56Error, Report, ReportReason, ReportTargetKind};
