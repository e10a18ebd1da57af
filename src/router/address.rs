//! WhatsApp address conventions.
//!
//! Addresses are `<id>@<server>`: `c.us`, `s.whatsapp.net` and `lid` are
//! individual users, `g.us` is a group, `status@broadcast` is the status feed
//! and any other `@broadcast` is a broadcast list.

const GROUP_SUFFIX: &str = "@g.us";
const BROADCAST_SUFFIX: &str = "@broadcast";
const STATUS_ADDRESS: &str = "status@broadcast";
const USER_SUFFIX: &str = "@c.us";

/// Address class of a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Individual,
    Group,
    Broadcast,
    Status,
}

pub fn classify(address: &str) -> AddressKind {
    let address = address.trim();
    if address == STATUS_ADDRESS {
        AddressKind::Status
    } else if address.ends_with(BROADCAST_SUFFIX) {
        AddressKind::Broadcast
    } else if address.ends_with(GROUP_SUFFIX) {
        AddressKind::Group
    } else {
        AddressKind::Individual
    }
}

/// Contact id for an address: the bare user part for individuals, the full
/// address for groups.
pub fn contact_id(address: &str) -> String {
    let address = address.trim();
    match classify(address) {
        AddressKind::Individual => address
            .split_once('@')
            .map(|(user, _)| user)
            .unwrap_or(address)
            .to_string(),
        _ => address.to_string(),
    }
}

/// Chat address to send to. Bare numbers are normalized to digits and given
/// the user suffix; full addresses pass through.
pub fn chat_id(contact: &str) -> String {
    let contact = contact.trim();
    if contact.contains('@') {
        return contact.to_string();
    }
    let digits: String = contact.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{}{}", digits, USER_SUFFIX)
}
