//! The fixed-size TLV message container.
//!
//! A message is one flat record: a small header (verb, sender, recipient,
//! body size, validity mark) followed by an 8 KiB inline body holding
//! `(key, length, value)` fields packed back to back. The struct is the
//! wire image; only the header and the used body prefix are transmitted.
//! Value semantics are deliberate: messages copy, there is no heap behind
//! them.

use std::fmt;
use std::mem;

use log::{debug, error};
use table_store::Tabular;

use crate::bus::Bus;
use crate::registry::{
    AgentKey, ResourceKey, ResourceType, NOT_AN_AGENT, NOT_A_RESOURCE, NO_MORE_RESOURCES,
    RESOURCE_BANG,
};

/// Inline body capacity of every message.
pub const BODY_CAPACITY: usize = 8 * 1024;

/// Largest value a single field may carry.
pub const FIELD_VALUE_MAX: usize = 256;

const KEY_SIZE: usize = mem::size_of::<ResourceKey>();
const LEN_SIZE: usize = mem::size_of::<u64>();

/// Bytes of key and declared length preceding every field value.
pub const FIELD_HEADER_SIZE: usize = KEY_SIZE + LEN_SIZE;

const VALID_MARK: u8 = 0x2a;

/// Intent carried by a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Verb {
    Get = 0,
    Set = 1,
    Create = 2,
    Delete = 3,
    Ack = 4,
}

impl Verb {
    /// Decodes a wire word; anything unrecognized reads as an acknowledge.
    pub fn from_wire(raw: u32) -> Verb {
        match raw {
            0 => Verb::Get,
            1 => Verb::Set,
            2 => Verb::Create,
            3 => Verb::Delete,
            _ => Verb::Ack,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verb::Get => "get",
            Verb::Set => "set",
            Verb::Create => "create",
            Verb::Delete => "delete",
            Verb::Ack => "acknowledge",
        })
    }
}

/// One message. `#[repr(C)]` so the struct's leading bytes are the wire
/// frame; the `reserved` word keeps the header free of interior padding.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Message {
    verb: u32,
    sender: AgentKey,
    recipient: AgentKey,
    reserved: u32,
    body_size: u64,
    valid: u8,
    body: [u8; BODY_CAPACITY],
}

/// Bytes preceding the body on the wire.
pub const HEADER_SIZE: usize = mem::offset_of!(Message, body);

impl Message {
    pub fn new() -> Message {
        Message {
            verb: Verb::Get as u32,
            sender: NOT_AN_AGENT,
            recipient: NOT_AN_AGENT,
            reserved: 0,
            body_size: 0,
            valid: VALID_MARK,
            body: [0; BODY_CAPACITY],
        }
    }

    pub fn with_verb(verb: Verb) -> Message {
        let mut message = Message::new();
        message.verb = verb as u32;
        message
    }

    pub fn verb(&self) -> Verb {
        Verb::from_wire(self.verb)
    }

    pub fn set_verb(&mut self, verb: Verb) {
        self.verb = verb as u32;
    }

    pub fn sender(&self) -> AgentKey {
        self.sender
    }

    pub fn set_sender(&mut self, sender: AgentKey) {
        self.sender = sender;
    }

    pub fn recipient(&self) -> AgentKey {
        self.recipient
    }

    pub fn set_recipient(&mut self, recipient: AgentKey) {
        self.recipient = recipient;
    }

    /// The used portion of the body.
    pub fn body(&self) -> &[u8] {
        &self.body[..self.body_size as usize]
    }

    pub fn body_size(&self) -> usize {
        self.body_size as usize
    }

    pub fn is_valid(&self) -> bool {
        self.valid == VALID_MARK
    }

    /// Marks the message unusable. There is no way back except [`erase`].
    ///
    /// [`erase`]: Message::erase
    pub fn invalidate(&mut self) {
        self.valid = 0;
    }

    /// Drops the body, keeping verb, sender, and recipient.
    pub fn erase(&mut self) {
        self.body_size = 0;
    }

    // --- building ---------------------------------------------------------

    /// Appends one field. A value longer than [`FIELD_VALUE_MAX`] is
    /// rejected outright; a field that would push the body past the
    /// recipient's cap rolls the size back and invalidates the message.
    pub fn append(&mut self, bus: &Bus, key: ResourceKey, value: &[u8]) {
        if value.len() > FIELD_VALUE_MAX {
            error!(
                "field length ({} bytes) exceeds maximum limit of {} bytes",
                value.len(),
                FIELD_VALUE_MAX
            );
            return;
        }

        let original = self.body_size;
        self.push_field(key, value.len() as u64, value);

        let cap = self.effective_cap(bus);
        if self.body_size as usize > cap {
            error!(
                "message size ({} bytes) exceeds maximum limit of {} bytes; truncating and invalidating",
                self.body_size, cap
            );
            self.body_size = original;
            self.invalidate();
        }
    }

    /// Appends a 32-bit integer as a field of `width` bytes, applying the
    /// recipient's dialect when representation is enabled.
    pub fn append_integer(&mut self, bus: &Bus, key: ResourceKey, width: usize, value: i32) {
        let represented = bus.represent_integer(self.recipient, key, i64::from(value)) as i32;
        let native = represented.to_ne_bytes();
        let mut field = [0u8; LEN_SIZE];
        let width = width.min(field.len());
        let used = width.min(native.len());
        field[..used].copy_from_slice(&native[..used]);
        self.append(bus, key, &field[..width]);
    }

    /// Appends a byte-string field, run through the recipient's dialect
    /// when representation is enabled.
    pub fn append_string(&mut self, bus: &Bus, key: ResourceKey, value: &[u8]) {
        if !bus.representation_enabled() {
            self.append(bus, key, value);
            return;
        }
        let mut represented = [0u8; FIELD_VALUE_MAX];
        let n = bus
            .represent_value(self.recipient, key, &mut represented, value)
            .min(FIELD_VALUE_MAX);
        self.append(bus, key, &represented[..n]);
    }

    /// Appends the zero-length row terminator.
    pub fn append_bang(&mut self, bus: &Bus) {
        self.append(bus, RESOURCE_BANG, &[]);
    }

    /// Writes a field header for a value of `len` bytes and hands back the
    /// value region for the caller to fill in place. `None`, with the
    /// message untouched, when the field would not fit.
    pub fn reserve(&mut self, bus: &Bus, key: ResourceKey, len: usize) -> Option<&mut [u8]> {
        let need = FIELD_HEADER_SIZE + len;
        let new_size = self.body_size as usize + need;
        if new_size > self.effective_cap(bus) {
            error!(
                "new payload size ({} bytes) exceeds maximum limit of {} bytes",
                new_size,
                self.effective_cap(bus)
            );
            return None;
        }

        let start = self.body_size as usize;
        self.body[start..start + KEY_SIZE].copy_from_slice(&key.to_ne_bytes());
        self.body[start + KEY_SIZE..start + FIELD_HEADER_SIZE]
            .copy_from_slice(&(len as u64).to_ne_bytes());
        self.body_size = new_size as u64;

        let value_start = start + FIELD_HEADER_SIZE;
        Some(&mut self.body[value_start..value_start + len])
    }

    /// Rewrites the declared length of the last field from `old_len` to
    /// `new_len`. The stored bytes and the body size stay put, so this is
    /// only sound for shrinking a just-reserved field before anything else
    /// is appended.
    pub fn constrict(&mut self, old_len: usize, new_len: usize) {
        let size = self.body_size as usize;
        if size < FIELD_HEADER_SIZE + old_len {
            error!("no trailing field of {} bytes to constrict", old_len);
            return;
        }
        let len_slot = size - old_len - LEN_SIZE;
        let declared = read_u64(&self.body, len_slot) as usize;
        if declared != old_len {
            error!(
                "looking for field of length {} bytes, found a field of length {} bytes",
                old_len, declared
            );
            return;
        }
        self.body[len_slot..len_slot + LEN_SIZE].copy_from_slice(&(new_len as u64).to_ne_bytes());
    }

    // --- walking ----------------------------------------------------------

    /// Key of the field at `field_start`. [`NO_MORE_RESOURCES`] past the
    /// end of the body; stored keys beyond the sentinel range read as
    /// [`NOT_A_RESOURCE`].
    pub fn resource_key(&self, field_start: usize) -> ResourceKey {
        if field_start + KEY_SIZE > self.body_size as usize {
            return NO_MORE_RESOURCES;
        }
        let key = read_u32(&self.body, field_start);
        if key > NO_MORE_RESOURCES {
            NOT_A_RESOURCE
        } else {
            key
        }
    }

    /// Declared value length of the field at `field_start`.
    pub fn field_size(&self, field_start: usize) -> usize {
        read_u64(&self.body, field_start + KEY_SIZE) as usize
    }

    /// The value region of the field at `field_start`, clamped to the
    /// buffer. `None` when the offset is outside it.
    pub fn field_value(&self, field_start: usize) -> Option<&[u8]> {
        let start = field_start + FIELD_HEADER_SIZE;
        if start >= BODY_CAPACITY {
            return None;
        }
        let len = self.field_size(field_start).min(BODY_CAPACITY - start);
        Some(&self.body[start..start + len])
    }

    /// Offset of the field after the one at `field_start`, clamped to the
    /// body size at the end of the walk.
    pub fn next_field_offset(&self, field_start: usize) -> usize {
        let size = self.body_size as usize;
        if field_start >= size || field_start + KEY_SIZE >= size {
            return size;
        }
        let len = read_u64(&self.body, field_start + KEY_SIZE) as usize;
        (field_start + FIELD_HEADER_SIZE).saturating_add(len).min(size)
    }

    /// Whether the field at `field_start` is the row terminator.
    pub fn is_bang(&self, field_start: usize) -> bool {
        self.resource_key(field_start) == RESOURCE_BANG
    }

    /// Copies the value at `field_start` into `dst` and returns the walk
    /// advance (header plus declared length).
    pub fn extract(&self, dst: &mut [u8], field_start: usize) -> usize {
        let declared = self.field_size(field_start);
        if let Some(value) = self.field_value(field_start) {
            let n = declared.min(value.len()).min(dst.len());
            dst[..n].copy_from_slice(&value[..n]);
        }
        FIELD_HEADER_SIZE + declared
    }

    /// Reads the field at `field_start` as a 32-bit integer, applying the
    /// recipient's dialect when representation is enabled.
    pub fn extract_integer(&self, bus: &Bus, field_start: usize) -> i64 {
        let mut native = [0u8; 4];
        self.extract(&mut native, field_start);
        let value = i64::from(i32::from_ne_bytes(native));
        bus.represent_integer(self.recipient, self.resource_key(field_start), value)
    }

    /// Copies or re-represents the value at `field_start` into `dst`,
    /// returning the bytes written.
    pub fn extract_string(&self, bus: &Bus, dst: &mut [u8], field_start: usize) -> usize {
        let key = self.resource_key(field_start);
        let value = self.field_value(field_start).unwrap_or(&[]);
        let declared = self.field_size(field_start).min(value.len());
        bus.represent_value(self.recipient, key, dst, &value[..declared])
    }

    // --- tabular projection -----------------------------------------------

    /// Walks the whole body into `db[table]`. Fields between two bangs form
    /// one row; a field whose key is `index_key` sets the row index for the
    /// rest of its row. String-shaped types store bytes, everything else
    /// stores integers, and the message verb lands in the `verb` column of
    /// every row. Returns the final walk offset.
    pub fn extract_into<D: Tabular>(
        &self,
        bus: &Bus,
        db: &mut D,
        table: &str,
        index_key: ResourceKey,
    ) -> usize {
        let size = self.body_size as usize;
        let mut offset = 0;
        let mut row: usize = 1;

        while offset < size {
            while offset < size && !self.is_bang(offset) {
                let key = self.resource_key(offset);
                let name = bus.resource_name(key).unwrap_or("").to_string();
                if key == index_key {
                    row = self.extract_integer(bus, offset).max(0) as usize;
                    db.set_integer(table, &name, row, row as i64);
                } else {
                    match bus.resource_type(key) {
                        ResourceType::UnknownType => {
                            error!("found a resource of unknown type; dumping field");
                            self.dump_field(offset);
                        }
                        ResourceType::OctetStr | ResourceType::Opaque | ResourceType::IpAddress => {
                            let mut value = [0u8; FIELD_VALUE_MAX + 1];
                            let n = self.extract_string(bus, &mut value, offset);
                            db.set_string(table, &name, row, &value[..n]);
                        }
                        _ => {
                            let value = self.extract_integer(bus, offset);
                            db.set_integer(table, &name, row, value);
                        }
                    }
                }
                offset = self.next_field_offset(offset);
            }
            db.set_integer(table, "verb", row, i64::from(self.verb));
            if offset < size {
                // step over the bang
                offset = self.next_field_offset(offset);
            }
        }
        offset
    }

    /// Serializes rows of `db[table]` into this message: the `verb` column
    /// drives the message verb, each named column appends as a string or an
    /// integer depending on which kind the cell holds. Returns the body
    /// size afterwards.
    pub fn append_from<D: Tabular>(
        &mut self,
        bus: &Bus,
        db: &D,
        table: &str,
        columns: &[&str],
    ) -> usize {
        let mut row = db.begin(table);
        while row < db.end(table) {
            self.set_verb(Verb::from_wire(db.get_integer(table, "verb", row) as u32));
            for column in columns {
                let key = bus.resource_key(column);
                if db.has_string(table, column, row) {
                    if let Some(value) = db.get_string(table, column, row) {
                        self.append_string(bus, key, value);
                    }
                } else if db.has_integer(table, column, row) {
                    let value = db.get_integer(table, column, row) as i32;
                    self.append_integer(bus, key, 4, value);
                }
            }
            row = db.next(table, row);
        }
        self.body_size()
    }

    fn dump_field(&self, field_start: usize) {
        let key = read_u32(&self.body, field_start);
        let declared = self.field_size(field_start);
        let value = self.field_value(field_start).unwrap_or(&[]);
        let shown = &value[..value.len().min(64)];
        debug!(
            "field at {}: key {}, {} declared bytes, leading bytes {:?}",
            field_start, key, declared, shown
        );
    }

    // --- wire -------------------------------------------------------------

    /// The transmitted image: header plus the used body prefix.
    pub(crate) fn frame(&self) -> &[u8] {
        let used = (self.body_size as usize).min(BODY_CAPACITY);
        &crate::struct_bytes(self)[..HEADER_SIZE + used]
    }

    /// Whether a frame of `frame_len` bytes decoded into this message is
    /// internally consistent.
    pub(crate) fn wire_consistent(&self, frame_len: usize) -> bool {
        if frame_len < HEADER_SIZE {
            return false;
        }
        let advertised = self.body_size as usize;
        advertised <= BODY_CAPACITY && HEADER_SIZE + advertised <= frame_len
    }

    fn effective_cap(&self, bus: &Bus) -> usize {
        bus.max_body_size(self.recipient).min(BODY_CAPACITY)
    }

    /// Tentatively writes a field and advances the body size by the full
    /// field extent; writes past the physical buffer are clamped so an
    /// oversized append can be rolled back safely.
    fn push_field(&mut self, key: ResourceKey, declared: u64, value: &[u8]) {
        let start = self.body_size as usize;
        copy_clamped(&mut self.body, start, &key.to_ne_bytes());
        copy_clamped(&mut self.body, start + KEY_SIZE, &declared.to_ne_bytes());
        copy_clamped(&mut self.body, start + FIELD_HEADER_SIZE, value);
        self.body_size += (FIELD_HEADER_SIZE + value.len()) as u64;
    }

    #[cfg(test)]
    pub(crate) fn force_body(&mut self, bytes: &[u8]) {
        self.body[..bytes.len()].copy_from_slice(bytes);
        self.body_size = bytes.len() as u64;
    }
}

impl Default for Message {
    fn default() -> Message {
        Message::new()
    }
}

fn copy_clamped(body: &mut [u8; BODY_CAPACITY], offset: usize, src: &[u8]) {
    if offset >= BODY_CAPACITY {
        return;
    }
    let n = src.len().min(BODY_CAPACITY - offset);
    body[offset..offset + n].copy_from_slice(&src[..n]);
}

fn read_u32(body: &[u8; BODY_CAPACITY], offset: usize) -> u32 {
    if offset + KEY_SIZE > BODY_CAPACITY {
        return 0;
    }
    u32::from_ne_bytes(body[offset..offset + KEY_SIZE].try_into().unwrap())
}

fn read_u64(body: &[u8; BODY_CAPACITY], offset: usize) -> u64 {
    if offset + LEN_SIZE > BODY_CAPACITY {
        return 0;
    }
    u64::from_ne_bytes(body[offset..offset + LEN_SIZE].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use table_store::{MemoryStore, Tabular};

    use super::*;
    use crate::bus::{Bus, BusConfig};

    const NAMES: &str = "/snmp\n\
                         /mux_manager\n\
                         /a\n\
                         /b\n\
                         color OCTET_STR\n\
                         ifIndex INTEGER\n\
                         linkUp BOOLEAN\n\
                         ifOid OBJECT_ID\n\
                         peerAddr IPADDRESS\n";

    fn test_bus(representation: bool) -> Bus {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(NAMES.as_bytes()).unwrap();
        Bus::open(BusConfig {
            config_path: file.path().to_path_buf(),
            representation,
            solipsism: true,
        })
    }

    #[test]
    fn fresh_messages_are_valid_and_empty() {
        let message = Message::new();
        assert!(message.is_valid());
        assert_eq!(message.body_size(), 0);
        assert_eq!(message.sender(), NOT_AN_AGENT);
        assert_eq!(message.recipient(), NOT_AN_AGENT);
    }

    #[test]
    fn append_then_extract_round_trips() {
        let bus = test_bus(false);
        let key = bus.resource_key("color");
        let mut message = Message::with_verb(Verb::Set);
        message.append(&bus, key, b"blue");

        assert_eq!(message.body_size(), FIELD_HEADER_SIZE + 4);
        assert_eq!(message.resource_key(0), key);
        assert_eq!(message.field_size(0), 4);

        let mut value = [0u8; 16];
        let advance = message.extract(&mut value, 0);
        assert_eq!(advance, FIELD_HEADER_SIZE + 4);
        assert_eq!(&value[..4], b"blue");
    }

    #[test]
    fn walk_advances_cover_exactly_the_body() {
        let bus = test_bus(false);
        let mut message = Message::with_verb(Verb::Set);
        message.append(&bus, bus.resource_key("color"), b"blue");
        message.append_integer(&bus, bus.resource_key("ifIndex"), 4, 12);
        message.append_bang(&bus);

        let mut offset = 0;
        let mut advances = 0;
        let mut steps = 0;
        while offset < message.body_size() {
            let next = message.next_field_offset(offset);
            advances += next - offset;
            offset = next;
            steps += 1;
            assert!(steps <= 3);
        }
        assert_eq!(advances, message.body_size());
        assert_eq!(message.resource_key(offset), NO_MORE_RESOURCES);
    }

    #[test]
    fn oversized_field_is_rejected_outright() {
        let bus = test_bus(false);
        let mut message = Message::new();
        message.append(&bus, bus.resource_key("color"), &[0u8; FIELD_VALUE_MAX + 1]);
        assert_eq!(message.body_size(), 0);
        assert!(message.is_valid());
    }

    #[test]
    fn overflowing_append_rolls_back_and_invalidates() {
        let mut bus = test_bus(false);
        let recipient = bus.create_agent_with("/tiny", 1, 32, true).unwrap();
        let mut message = Message::new();
        message.set_recipient(recipient);

        message.append(&bus, bus.resource_key("color"), &[7u8; 64]);
        assert_eq!(message.body_size(), 0);
        assert!(!message.is_valid());
    }

    #[test]
    fn append_after_overflow_keeps_the_rollback_size() {
        let mut bus = test_bus(false);
        let recipient = bus.create_agent_with("/tiny", 1, 40, true).unwrap();
        let mut message = Message::new();
        message.set_recipient(recipient);

        message.append(&bus, bus.resource_key("color"), b"ok");
        let settled = message.body_size();
        message.append(&bus, bus.resource_key("color"), &[7u8; 64]);
        assert_eq!(message.body_size(), settled);
        assert!(!message.is_valid());
    }

    #[test]
    fn erase_clears_the_body_but_not_the_addressing() {
        let bus = test_bus(false);
        let mut message = Message::with_verb(Verb::Delete);
        message.set_sender(3);
        message.append(&bus, bus.resource_key("color"), b"blue");
        message.erase();

        assert_eq!(message.body_size(), 0);
        assert_eq!(message.verb(), Verb::Delete);
        assert_eq!(message.sender(), 3);
    }

    #[test]
    fn reserve_and_constrict_shrink_the_last_field() {
        let bus = test_bus(false);
        let key = bus.resource_key("color");
        let mut message = Message::new();

        let region = message.reserve(&bus, key, 16).unwrap();
        region[..6].copy_from_slice(b"purple");
        message.constrict(16, 6);

        assert_eq!(message.field_size(0), 6);
        let mut value = [0u8; 16];
        message.extract(&mut value, 0);
        assert_eq!(&value[..6], b"purple");
        // body size still accounts for the full reservation
        assert_eq!(message.body_size(), FIELD_HEADER_SIZE + 16);
    }

    #[test]
    fn constrict_with_wrong_length_is_a_no_op() {
        let bus = test_bus(false);
        let mut message = Message::new();
        message.reserve(&bus, bus.resource_key("color"), 16).unwrap();
        message.constrict(8, 4);
        assert_eq!(message.field_size(0), 16);
    }

    #[test]
    fn reserve_past_the_cap_leaves_the_message_unchanged() {
        let mut bus = test_bus(false);
        let recipient = bus.create_agent_with("/tiny", 1, 32, true).unwrap();
        let mut message = Message::new();
        message.set_recipient(recipient);

        assert!(message.reserve(&bus, bus.resource_key("color"), 64).is_none());
        assert_eq!(message.body_size(), 0);
        assert!(message.is_valid());
    }

    #[test]
    fn stored_sentinel_keys_normalize_on_read() {
        let bus = test_bus(false);
        let mut message = Message::new();
        message.append(&bus, NO_MORE_RESOURCES + 7, b"x");
        assert_eq!(message.resource_key(0), NOT_A_RESOURCE);
        assert_eq!(message.resource_key(message.body_size()), NO_MORE_RESOURCES);
    }

    #[test]
    fn bang_fields_are_recognized() {
        let bus = test_bus(false);
        let mut message = Message::new();
        message.append_bang(&bus);
        assert!(message.is_bang(0));
        assert_eq!(message.field_size(0), 0);
    }

    #[test]
    fn representation_applies_to_integer_fields() {
        let mut bus = test_bus(true);
        let snmp = bus.create_agent_with("/snmp", 1, 4096, true).unwrap();
        let link_up = bus.resource_key("linkUp");
        let oid = bus.resource_key("ifOid");

        let mut message = Message::with_verb(Verb::Set);
        message.set_recipient(snmp);
        message.append_integer(&bus, link_up, 4, 1);
        message.append_integer(&bus, oid, 4, 9);

        // raw wire values hold the peer's forms
        let mut raw = [0u8; 4];
        message.extract(&mut raw, 0);
        assert_eq!(i32::from_ne_bytes(raw), 1);
        let second = message.next_field_offset(0);
        message.extract(&mut raw, second);
        assert_eq!(i32::from_ne_bytes(raw), 10);
    }

    #[test]
    fn representation_packs_addresses_for_the_snmp_peer() {
        let mut bus = test_bus(true);
        let snmp = bus.create_agent_with("/snmp", 1, 4096, true).unwrap();
        let addr = bus.resource_key("peerAddr");

        let mut message = Message::new();
        message.set_recipient(snmp);
        message.append_string(&bus, addr, b"10.1.2.3");

        assert_eq!(message.field_size(0), 5);
        let value = message.field_value(0).unwrap();
        assert_eq!(&value[..5], &[10, 1, 2, 3, 0]);
    }

    #[test]
    fn bang_delimited_rows_project_into_the_store() {
        let mut bus = test_bus(false);
        let recipient = bus.create_agent_with("/b", 2, 4096, true).unwrap();
        let index_key = bus.resource_key("ifIndex");
        let color = bus.resource_key("color");

        let mut message = Message::with_verb(Verb::Set);
        message.set_recipient(recipient);
        message.append_integer(&bus, index_key, 4, 1);
        message.append(&bus, color, b"blue");
        message.append_bang(&bus);
        message.append_integer(&bus, index_key, 4, 2);
        message.append(&bus, color, b"green");
        message.append_bang(&bus);

        let mut store = MemoryStore::new();
        let end = message.extract_into(&bus, &mut store, "ifTable", index_key);

        assert_eq!(end, message.body_size());
        assert_eq!(store.get_string("ifTable", "color", 1), Some(&b"blue"[..]));
        assert_eq!(store.get_string("ifTable", "color", 2), Some(&b"green"[..]));
        assert_eq!(store.get_integer("ifTable", "verb", 1), Verb::Set as i64);
        assert_eq!(store.get_integer("ifTable", "verb", 2), Verb::Set as i64);
    }

    #[test]
    fn append_from_mirrors_extract_into() {
        let bus = test_bus(false);
        let mut store = MemoryStore::new();
        store.set_integer("ifTable", "verb", 1, Verb::Create as i64);
        store.set_integer("ifTable", "ifIndex", 1, 4);
        store.set_string("ifTable", "color", 1, b"red");

        let mut message = Message::new();
        let size = message.append_from(&bus, &store, "ifTable", &["ifIndex", "color"]);

        assert_eq!(size, message.body_size());
        assert_eq!(message.verb(), Verb::Create);
        assert_eq!(message.resource_key(0), bus.resource_key("ifIndex"));
        let second = message.next_field_offset(0);
        assert_eq!(message.resource_key(second), bus.resource_key("color"));
        let mut value = [0u8; 8];
        message.extract(&mut value, second);
        assert_eq!(&value[..3], b"red");
    }

    #[test]
    fn wire_frame_is_header_plus_used_body() {
        let bus = test_bus(false);
        let mut message = Message::new();
        message.append(&bus, bus.resource_key("color"), b"blue");
        assert_eq!(message.frame().len(), HEADER_SIZE + message.body_size());
        assert!(message.wire_consistent(message.frame().len()));
        assert!(!message.wire_consistent(HEADER_SIZE - 1));
    }
}
