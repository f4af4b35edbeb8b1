//! Information-Element metadata registry (spec §1: "out of scope, treat as
//! an opaque `IeManager`"). We still need *something* that resolves
//! `(PEN, element id) -> descriptor` so the Template Manager's "IE manager
//! rebinding" operation (spec §4.4) and the NetFlow v9 converter's element
//! lookups have a concrete type to call. `IeManager` is the seam; the
//! default population below only knows the handful of elements this spec's
//! own converters and Options Template classification touch.

use std::collections::HashMap;

/// Data type of an Information Element, used only to decide how the wire
/// codecs in `wire::codec` should interpret a field's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IeType {
    UnsignedInt,
    SignedInt,
    Float,
    Boolean,
    MacAddress,
    Ipv4Address,
    Ipv6Address,
    String,
    OctetArray,
    DateTimeSeconds,
    DateTimeMilliseconds,
    DateTimeMicroseconds,
    DateTimeNanoseconds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IeDescriptor {
    pub pen: u32,
    pub id: u16,
    pub name: &'static str,
    pub ty: IeType,
}

/// Private Enterprise Number 0 is IANA's own namespace.
pub const IANA_PEN: u32 = 0;

pub trait IeManager: Send + Sync {
    fn lookup(&self, pen: u32, id: u16) -> Option<IeDescriptor>;
}

/// Default, in-memory population of the IANA elements this crate's own
/// converters and Options Template classification logic reference by name
/// (spec §4.3's NetFlow v5 synthetic template, §4.5's FlowKeys
/// classification). A production deployment would inject a fuller registry
/// loaded from the IANA XML; that loader is out of scope (spec §1).
pub struct DefaultIeManager {
    table: HashMap<(u32, u16), IeDescriptor>,
}

macro_rules! ie {
    ($table:expr, $id:expr, $name:expr, $ty:expr) => {
        $table.insert(
            (IANA_PEN, $id),
            IeDescriptor { pen: IANA_PEN, id: $id, name: $name, ty: $ty },
        );
    };
}

impl Default for DefaultIeManager {
    fn default() -> Self {
        let mut table = HashMap::new();
        ie!(table, 1, "octetDeltaCount", IeType::UnsignedInt);
        ie!(table, 2, "packetDeltaCount", IeType::UnsignedInt);
        ie!(table, 4, "protocolIdentifier", IeType::UnsignedInt);
        ie!(table, 5, "ipClassOfService", IeType::UnsignedInt);
        ie!(table, 6, "tcpControlBits", IeType::UnsignedInt);
        ie!(table, 7, "sourceTransportPort", IeType::UnsignedInt);
        ie!(table, 8, "sourceIPv4Address", IeType::Ipv4Address);
        ie!(table, 9, "sourceIPv4PrefixLength", IeType::UnsignedInt);
        ie!(table, 10, "ingressInterface", IeType::UnsignedInt);
        ie!(table, 11, "destinationTransportPort", IeType::UnsignedInt);
        ie!(table, 12, "destinationIPv4Address", IeType::Ipv4Address);
        ie!(table, 13, "destinationIPv4PrefixLength", IeType::UnsignedInt);
        ie!(table, 14, "egressInterface", IeType::UnsignedInt);
        ie!(table, 15, "ipNextHopIPv4Address", IeType::Ipv4Address);
        ie!(table, 16, "bgpSourceAsNumber", IeType::UnsignedInt);
        ie!(table, 17, "bgpDestinationAsNumber", IeType::UnsignedInt);
        ie!(table, 21, "flowEndSysUpTime", IeType::UnsignedInt);
        ie!(table, 22, "flowStartSysUpTime", IeType::UnsignedInt);
        ie!(table, 27, "sourceIPv6Address", IeType::Ipv6Address);
        ie!(table, 28, "destinationIPv6Address", IeType::Ipv6Address);
        ie!(table, 34, "samplingInterval", IeType::UnsignedInt);
        ie!(table, 35, "samplingAlgorithm", IeType::UnsignedInt);
        ie!(table, 56, "sourceMacAddress", IeType::MacAddress);
        ie!(table, 58, "vlanId", IeType::UnsignedInt);
        ie!(table, 61, "flowDirection", IeType::UnsignedInt);
        ie!(table, 80, "destinationMacAddress", IeType::MacAddress);
        ie!(table, 136, "flowEndReason", IeType::UnsignedInt);
        ie!(table, 144, "exportingProcessId", IeType::UnsignedInt);
        ie!(table, 145, "templateId", IeType::UnsignedInt);
        ie!(table, 149, "observationDomainId", IeType::UnsignedInt);
        ie!(table, 150, "flowStartSeconds", IeType::DateTimeSeconds);
        ie!(table, 151, "flowEndSeconds", IeType::DateTimeSeconds);
        ie!(table, 152, "flowStartMilliseconds", IeType::DateTimeMilliseconds);
        ie!(table, 153, "flowEndMilliseconds", IeType::DateTimeMilliseconds);
        ie!(table, 154, "flowStartMicroseconds", IeType::DateTimeMicroseconds);
        ie!(table, 155, "flowEndMicroseconds", IeType::DateTimeMicroseconds);
        ie!(table, 156, "flowStartNanoseconds", IeType::DateTimeNanoseconds);
        ie!(table, 157, "flowEndNanoseconds", IeType::DateTimeNanoseconds);
        ie!(table, 173, "flowKeyIndicator", IeType::UnsignedInt);
        ie!(table, 210, "paddingOctets", IeType::OctetArray);
        DefaultIeManager { table }
    }
}

impl IeManager for DefaultIeManager {
    fn lookup(&self, pen: u32, id: u16) -> Option<IeDescriptor> {
        self.table.get(&(pen, id)).cloned()
    }
}
