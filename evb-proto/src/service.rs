/// Transition kind carried in the low five bits of the datagram control byte.
///
/// `L1Accept` marks an ordinary triggered event; everything else is a
/// run-control transition that flushes batches and is forwarded to
/// non-selected builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Service {
    ClearReadout = 0,
    Reset = 1,
    Configure = 2,
    Unconfigure = 3,
    BeginRun = 4,
    EndRun = 5,
    BeginStep = 6,
    EndStep = 7,
    Enable = 8,
    Disable = 9,
    SlowUpdate = 10,
    L1Accept = 12,
}

impl Service {
    /// Decodes a five-bit service value from the wire.
    pub fn from_wire(val: u8) -> Option<Service> {
        Some(match val & 0x1f {
            0 => Service::ClearReadout,
            1 => Service::Reset,
            2 => Service::Configure,
            3 => Service::Unconfigure,
            4 => Service::BeginRun,
            5 => Service::EndRun,
            6 => Service::BeginStep,
            7 => Service::EndStep,
            8 => Service::Enable,
            9 => Service::Disable,
            10 => Service::SlowUpdate,
            12 => Service::L1Accept,
            _ => return None,
        })
    }

    /// True for ordinary triggered events, false for transitions.
    #[inline]
    pub fn is_event(self) -> bool {
        self == Service::L1Accept
    }

    /// True for the services a contributor may keep batching through.
    /// Anything else forces the open batch to close.
    #[inline]
    pub fn is_batchable(self) -> bool {
        matches!(self, Service::L1Accept | Service::SlowUpdate)
    }

    pub fn name(self) -> &'static str {
        match self {
            Service::ClearReadout => "ClearReadout",
            Service::Reset => "Reset",
            Service::Configure => "Configure",
            Service::Unconfigure => "Unconfigure",
            Service::BeginRun => "BeginRun",
            Service::EndRun => "EndRun",
            Service::BeginStep => "BeginStep",
            Service::EndStep => "EndStep",
            Service::Enable => "Enable",
            Service::Disable => "Disable",
            Service::SlowUpdate => "SlowUpdate",
            Service::L1Accept => "L1Accept",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
