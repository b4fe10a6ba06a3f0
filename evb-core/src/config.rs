use crate::error::ConfigError;
use evb_proto::constants::{
    CREDIT_WAIT_MS, MAX_BATCHES, MAX_ENTRIES, NUM_READOUT_GROUPS, TR_BUFFERS,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::{fs, io::Write};

/// Parameters for one builder instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderParams {
    /// This builder's peer identifier.
    pub id: u8,
    /// Bitmap of expected contributor identifiers.
    pub contributors: u64,
    /// Contract table: for each readout group, the contributors required to
    /// complete an event triggered by that group.
    pub contract: [u64; NUM_READOUT_GROUPS],
    /// Fragment entries per batch window; power of two.
    pub max_entries: usize,
    /// Event-buffer batches per contributor region.
    pub max_ev_buffers: usize,
    /// Transition slots per contributor region.
    pub max_tr_buffers: usize,
    /// Size of one transition slot, bytes.
    pub max_tr_size: usize,
    /// Age after which the oldest stuck event is fixed up, milliseconds.
    pub event_timeout_ms: u64,
}

impl Default for BuilderParams {
    fn default() -> Self {
        Self {
            id: 0,
            contributors: 1,
            contract: {
                let mut table = [0u64; NUM_READOUT_GROUPS];
                table[0] = 1;
                table
            },
            max_entries: MAX_ENTRIES,
            max_ev_buffers: MAX_BATCHES,
            max_tr_buffers: TR_BUFFERS,
            max_tr_size: 4096,
            event_timeout_ms: 2000,
        }
    }
}

impl BuilderParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_entries.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                name: "max_entries",
                value: self.max_entries,
            });
        }
        for (group, &mask) in self.contract.iter().enumerate() {
            let extra = mask & !self.contributors;
            if extra != 0 {
                return Err(ConfigError::BadContract { group, extra });
            }
        }
        Ok(())
    }

    /// Epoch capacity of the engine: one per event batch plus one per
    /// transition slot, so transitions can never starve event reassembly.
    pub fn epochs(&self) -> usize {
        self.max_ev_buffers + self.max_tr_buffers
    }
}

/// Parameters for one contributor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorParams {
    /// This contributor's peer identifier.
    pub id: u8,
    /// Bitmap of builder identifiers this contributor posts to.
    pub builders: u64,
    /// The common readout group; fragments not triggered by it bypass the
    /// builders entirely.
    pub partition: u8,
    /// Readout groups for which this contributor acts as a contractor.
    pub contractor: u16,
    /// Whether L1 fragments are accumulated into batches at all.
    pub batching: bool,
    /// Fragment entries per batch window; power of two.
    pub max_entries: usize,
    /// Batch slots in the pre-registered ring; power of two.
    pub batch_count: usize,
    /// Size of one fragment slot, bytes (header included).
    pub max_input_size: usize,
    /// Size of one result slot, bytes.
    pub max_result_size: usize,
    /// Size of one remote transition slot, bytes.
    pub max_tr_size: usize,
    /// Transition-buffer credits per builder; must agree with the builders'
    /// provisioning.
    pub max_tr_buffers: usize,
    /// Bounded wait for a transition-buffer credit, milliseconds.
    pub credit_wait_ms: u64,
}

impl Default for ContributorParams {
    fn default() -> Self {
        Self {
            id: 0,
            builders: 1,
            partition: 0,
            contractor: 1,
            batching: true,
            max_entries: MAX_ENTRIES,
            batch_count: MAX_BATCHES,
            max_input_size: 4096,
            max_result_size: 64,
            max_tr_size: 4096,
            max_tr_buffers: TR_BUFFERS,
            credit_wait_ms: CREDIT_WAIT_MS,
        }
    }
}

impl ContributorParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_entries.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                name: "max_entries",
                value: self.max_entries,
            });
        }
        if !self.batch_count.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                name: "batch_count",
                value: self.batch_count,
            });
        }
        if self.batch_count > MAX_BATCHES {
            return Err(ConfigError::RingTooLarge {
                batch_count: self.batch_count,
            });
        }
        Ok(())
    }

    pub fn num_builders(&self) -> usize {
        self.builders.count_ones() as usize
    }
}

/// Loads a parameter struct from a JSON file, falling back to defaults when
/// the file does not exist yet.
pub fn load_config<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(ConfigError::Io(e.to_string())),
    }
}

/// Writes a parameter struct as pretty-printed JSON.
pub fn save_config<T: Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let text =
        serde_json::to_string_pretty(config).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut file = fs::File::create(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    file.write_all(text.as_bytes())
        .map_err(|e| ConfigError::Io(e.to_string()))
}
