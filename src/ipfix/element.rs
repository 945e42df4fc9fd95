//! Information element registry.
//!
//! Maps element names to `(enterprise number, element id)` pairs and their
//! abstract data types. The registry is read-only once built; components
//! borrow it explicitly instead of reaching for a global.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// IANA enterprise number.
pub const IANA_PEN: u32 = 0;

/// Enterprise number carrying reverse values of biflow records (RFC 5103).
pub const REVERSE_PEN: u32 = 29305;

/// IPFIX abstract data types supported by the aggregation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Signed8,
    Signed16,
    Signed32,
    Signed64,
    Float64,
    Boolean,
    Ipv4Address,
    Ipv6Address,
    MacAddress,
    String,
    OctetArray,
    DateTimeSeconds,
    DateTimeMilliseconds,
    DateTimeMicroseconds,
    DateTimeNanoseconds,
}

impl ElementType {
    /// Returns true for any of the four timestamp encodings.
    pub fn is_datetime(self) -> bool {
        matches!(
            self,
            Self::DateTimeSeconds
                | Self::DateTimeMilliseconds
                | Self::DateTimeMicroseconds
                | Self::DateTimeNanoseconds
        )
    }
}

/// A single information element definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub pen: u32,
    pub id: u16,
    pub name: String,
    pub data_type: ElementType,
}

/// A named group of elements that should be treated as one logical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub name: String,
    pub sources: Vec<(u32, u16)>,
}

/// How a field of a biflow record is resolved for the reverse direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseLookup {
    /// The element is shared by both directions.
    Same,
    /// The reverse direction reads the source/destination counterpart.
    Swap(u16),
    /// The reverse direction reads the element under [`REVERSE_PEN`].
    Reverse(u16),
    /// The element has no reverse value.
    Missing,
}

// Source/destination pairs swapped when reading the reverse half of a biflow.
const IANA_PAIRS: &[(u16, u16)] = &[
    (7, 11),   // sourceTransportPort / destinationTransportPort
    (8, 12),   // sourceIPv4Address / destinationIPv4Address
    (10, 14),  // ingressInterface / egressInterface
    (27, 28),  // sourceIPv6Address / destinationIPv6Address
    (56, 80),  // sourceMacAddress / destinationMacAddress
    (9, 13),   // sourceIPv4PrefixLength / destinationIPv4PrefixLength
];

// Elements that describe the whole biflow rather than one direction.
const IANA_COMMON: &[u16] = &[4, 58, 61, 96, 136, 148];

/// Resolves how `(pen, id)` is read from the reverse half of a biflow record.
pub fn reverse_lookup(pen: u32, id: u16) -> ReverseLookup {
    if pen != IANA_PEN {
        return ReverseLookup::Missing;
    }

    for &(a, b) in IANA_PAIRS {
        if id == a {
            return ReverseLookup::Swap(b);
        }
        if id == b {
            return ReverseLookup::Swap(a);
        }
    }

    if IANA_COMMON.contains(&id) {
        ReverseLookup::Same
    } else {
        ReverseLookup::Reverse(id)
    }
}

/// Read-only lookup table of elements and aliases.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    elements: Vec<Element>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<(u32, u16), usize>,
    aliases: HashMap<String, Alias>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared registry preloaded with common IANA elements.
    ///
    /// Initialised once per process; only the composition root should call
    /// this, everything below it takes a `&Registry`.
    pub fn builtin() -> Arc<Registry> {
        static BUILTIN: OnceLock<Arc<Registry>> = OnceLock::new();
        BUILTIN
            .get_or_init(|| Arc::new(Registry::with_iana_elements()))
            .clone()
    }

    /// Registers an element. A later registration with the same name or id
    /// shadows the earlier one.
    pub fn add_element(&mut self, pen: u32, id: u16, name: &str, data_type: ElementType) {
        let index = self.elements.len();
        self.elements.push(Element {
            pen,
            id,
            name: name.to_string(),
            data_type,
        });
        self.by_name.insert(name.to_string(), index);
        self.by_id.insert((pen, id), index);
    }

    /// Registers an alias over already registered element names.
    ///
    /// Names that are not registered are ignored.
    pub fn add_alias(&mut self, name: &str, sources: &[&str]) {
        let sources = sources
            .iter()
            .filter_map(|source| self.find_name(source))
            .map(|elem| (elem.pen, elem.id))
            .collect();
        self.aliases.insert(
            name.to_string(),
            Alias {
                name: name.to_string(),
                sources,
            },
        );
    }

    /// Looks up an element by exact name.
    pub fn find_name(&self, name: &str) -> Option<&Element> {
        self.by_name.get(name).map(|&i| &self.elements[i])
    }

    /// Looks up an element by enterprise number and id.
    pub fn find_id(&self, pen: u32, id: u16) -> Option<&Element> {
        self.by_id.get(&(pen, id)).map(|&i| &self.elements[i])
    }

    /// Looks up an alias by exact name.
    pub fn find_alias(&self, name: &str) -> Option<&Alias> {
        self.aliases.get(name)
    }

    /// Resolves a `"<pen>:<id>"` reference, e.g. `"0:8"`.
    pub fn find_ref(&self, reference: &str) -> Option<&Element> {
        let (pen, id) = reference.split_once(':')?;
        let pen = pen.trim().parse().ok()?;
        let id = id.trim().parse().ok()?;
        self.find_id(pen, id)
    }

    /// Number of registered elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if no elements are registered.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn with_iana_elements() -> Self {
        use ElementType::*;

        let mut reg = Registry::new();

        let iana: &[(u16, &str, ElementType)] = &[
            (1, "octetDeltaCount", Unsigned64),
            (2, "packetDeltaCount", Unsigned64),
            (4, "protocolIdentifier", Unsigned8),
            (5, "ipClassOfService", Unsigned8),
            (6, "tcpControlBits", Unsigned16),
            (7, "sourceTransportPort", Unsigned16),
            (8, "sourceIPv4Address", Ipv4Address),
            (9, "sourceIPv4PrefixLength", Unsigned8),
            (10, "ingressInterface", Unsigned32),
            (11, "destinationTransportPort", Unsigned16),
            (12, "destinationIPv4Address", Ipv4Address),
            (13, "destinationIPv4PrefixLength", Unsigned8),
            (14, "egressInterface", Unsigned32),
            (27, "sourceIPv6Address", Ipv6Address),
            (28, "destinationIPv6Address", Ipv6Address),
            (32, "icmpTypeCodeIPv4", Unsigned16),
            (56, "sourceMacAddress", MacAddress),
            (58, "vlanId", Unsigned16),
            (61, "flowDirection", Unsigned8),
            (80, "destinationMacAddress", MacAddress),
            (85, "octetTotalCount", Unsigned64),
            (86, "packetTotalCount", Unsigned64),
            (94, "applicationDescription", String),
            (95, "applicationId", OctetArray),
            (96, "applicationName", String),
            (136, "flowEndReason", Unsigned8),
            (148, "flowId", Unsigned64),
            (150, "flowStartSeconds", DateTimeSeconds),
            (151, "flowEndSeconds", DateTimeSeconds),
            (152, "flowStartMilliseconds", DateTimeMilliseconds),
            (153, "flowEndMilliseconds", DateTimeMilliseconds),
            (154, "flowStartMicroseconds", DateTimeMicroseconds),
            (155, "flowEndMicroseconds", DateTimeMicroseconds),
            (156, "flowStartNanoseconds", DateTimeNanoseconds),
            (157, "flowEndNanoseconds", DateTimeNanoseconds),
            (176, "icmpTypeIPv4", Unsigned8),
            (177, "icmpCodeIPv4", Unsigned8),
            (210, "paddingOctets", OctetArray),
            (434, "mibObjectValueInteger", Signed32),
        ];

        for &(id, name, data_type) in iana {
            reg.add_element(IANA_PEN, id, name, data_type);
        }

        for &(id, name, data_type) in iana {
            if let ReverseLookup::Reverse(rev_id) = reverse_lookup(IANA_PEN, id) {
                let reverse_name = format!("reverse{}{}", name[..1].to_uppercase(), &name[1..]);
                reg.add_element(REVERSE_PEN, rev_id, &reverse_name, data_type);
            }
        }

        reg.add_alias("srcip", &["sourceIPv4Address", "sourceIPv6Address"]);
        reg.add_alias("dstip", &["destinationIPv4Address", "destinationIPv6Address"]);
        reg.add_alias(
            "ip",
            &[
                "sourceIPv4Address",
                "sourceIPv6Address",
                "destinationIPv4Address",
                "destinationIPv6Address",
            ],
        );
        reg.add_alias("ip4", &["sourceIPv4Address", "destinationIPv4Address"]);
        reg.add_alias("ip6", &["sourceIPv6Address", "destinationIPv6Address"]);
        reg.add_alias("srcport", &["sourceTransportPort"]);
        reg.add_alias("dstport", &["destinationTransportPort"]);
        reg.add_alias("port", &["sourceTransportPort", "destinationTransportPort"]);
        reg.add_alias("srcmac", &["sourceMacAddress"]);
        reg.add_alias("dstmac", &["destinationMacAddress"]);
        reg.add_alias("bytes", &["octetDeltaCount"]);
        reg.add_alias("packets", &["packetDeltaCount"]);
        reg.add_alias("proto", &["protocolIdentifier"]);

        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup_by_name_and_id() {
        let reg = Registry::builtin();
        let elem = reg.find_name("sourceIPv4Address").expect("element");
        assert_eq!((elem.pen, elem.id), (IANA_PEN, 8));
        assert_eq!(elem.data_type, ElementType::Ipv4Address);

        let same = reg.find_id(IANA_PEN, 8).expect("by id");
        assert_eq!(same, elem);
        assert_eq!(reg.find_ref("0:8"), Some(elem));
        assert!(reg.find_name("noSuchElement").is_none());
    }

    #[test]
    fn test_builtin_reverse_elements() {
        let reg = Registry::builtin();
        let rev = reg.find_name("reverseOctetDeltaCount").expect("reverse");
        assert_eq!((rev.pen, rev.id), (REVERSE_PEN, 1));
        // Addresses are swapped, not reversed.
        assert!(reg.find_name("reverseSourceIPv4Address").is_none());
    }

    #[test]
    fn test_alias_sources_resolved() {
        let reg = Registry::builtin();
        let alias = reg.find_alias("ip").expect("alias");
        assert_eq!(alias.sources, vec![(0, 8), (0, 27), (0, 12), (0, 28)]);
    }

    #[test]
    fn test_alias_ignores_unknown_sources() {
        let mut reg = Registry::new();
        reg.add_element(0, 1, "a", ElementType::Unsigned8);
        reg.add_alias("x", &["a", "missing"]);
        assert_eq!(reg.find_alias("x").expect("alias").sources, vec![(0, 1)]);
    }

    #[test]
    fn test_reverse_lookup_kinds() {
        assert_eq!(reverse_lookup(IANA_PEN, 8), ReverseLookup::Swap(12));
        assert_eq!(reverse_lookup(IANA_PEN, 11), ReverseLookup::Swap(7));
        assert_eq!(reverse_lookup(IANA_PEN, 4), ReverseLookup::Same);
        assert_eq!(reverse_lookup(IANA_PEN, 1), ReverseLookup::Reverse(1));
        assert_eq!(reverse_lookup(8057, 1), ReverseLookup::Missing);
    }
}
