/// The message header-field code.
///
/// Every header field is transmitted as a `(code, variant)` pair; these are
/// the codes assigned by the D-Bus specification. Codes outside this range
/// are skipped when decoding.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FieldCode {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

impl FieldCode {
    /// `None` for codes this implementation does not know; the decoder
    /// discards those fields.
    pub fn from_code(code: u8) -> Option<FieldCode> {
        match code {
            1 => Some(FieldCode::Path),
            2 => Some(FieldCode::Interface),
            3 => Some(FieldCode::Member),
            4 => Some(FieldCode::ErrorName),
            5 => Some(FieldCode::ReplySerial),
            6 => Some(FieldCode::Destination),
            7 => Some(FieldCode::Sender),
            8 => Some(FieldCode::Signature),
            9 => Some(FieldCode::UnixFds),
            _ => None,
        }
    }
}
