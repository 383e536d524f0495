//! Process-image data store
//!
//! Four independently locked spaces: coils and holding registers (read/write
//! from the network), discrete inputs and input registers (written locally by
//! the device, read-only from the network).
//!
//! Every access is bounds-checked against the space size and rejected, never
//! clamped. A multi-value write holds the space lock for its whole span, so it
//! lands entirely or not at all. Changes to coils and holding registers are
//! reported to registered [`ChangeObserver`]s once the lock is released.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::trace;

use crate::config::DataStoreConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::session::ServerInfo;

/// One of the four Modbus data spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSpace {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl fmt::Display for DataSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Coils => "coils",
            Self::DiscreteInputs => "discrete inputs",
            Self::HoldingRegisters => "holding registers",
            Self::InputRegisters => "input registers",
        })
    }
}

/// Receives value changes on coils and holding registers.
///
/// Called on the writer's task after the space lock is released, once per
/// changed index. `info` is `None` for local writes.
pub trait ChangeObserver: Send + Sync {
    fn on_coil_change(&self, _address: u16, _from: bool, _to: bool, _info: Option<&ServerInfo<'_>>) {}

    fn on_holding_register_change(
        &self,
        _address: u16,
        _from: u16,
        _to: u16,
        _info: Option<&ServerInfo<'_>>,
    ) {
    }
}

type Change<T> = (u16, T, T);

/// Thread-safe Modbus process image
pub struct DataStore {
    coils: Mutex<Vec<bool>>,
    discrete_inputs: Mutex<Vec<bool>>,
    holding_registers: Mutex<Vec<u16>>,
    input_registers: Mutex<Vec<u16>>,
    observers: RwLock<Vec<Arc<dyn ChangeObserver>>>,
}

impl fmt::Debug for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore")
            .field("coils", &self.size(DataSpace::Coils))
            .field("discrete_inputs", &self.size(DataSpace::DiscreteInputs))
            .field("holding_registers", &self.size(DataSpace::HoldingRegisters))
            .field("input_registers", &self.size(DataSpace::InputRegisters))
            .finish()
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::build(&DataStoreConfig::default())
    }
}

impl DataStore {
    /// 65536 entries per space, all zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &DataStoreConfig) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: &DataStoreConfig) -> Self {
        Self {
            coils: Mutex::new(vec![config.coils_default; config.coils_size]),
            discrete_inputs: Mutex::new(vec![
                config.discrete_inputs_default;
                config.discrete_inputs_size
            ]),
            holding_registers: Mutex::new(vec![
                config.holding_registers_default;
                config.holding_registers_size
            ]),
            input_registers: Mutex::new(vec![
                config.input_registers_default;
                config.input_registers_size
            ]),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer for coil and holding register changes
    pub fn subscribe(&self, observer: Arc<dyn ChangeObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    /// Number of entries in `space`
    pub fn size(&self, space: DataSpace) -> usize {
        match space {
            DataSpace::Coils => lock_len(&self.coils),
            DataSpace::DiscreteInputs => lock_len(&self.discrete_inputs),
            DataSpace::HoldingRegisters => lock_len(&self.holding_registers),
            DataSpace::InputRegisters => lock_len(&self.input_registers),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn read_coils(&self, address: u16, count: usize) -> ModbusResult<Vec<bool>> {
        read_space(DataSpace::Coils, &self.coils, address, count)
    }

    pub fn read_discrete_inputs(&self, address: u16, count: usize) -> ModbusResult<Vec<bool>> {
        read_space(DataSpace::DiscreteInputs, &self.discrete_inputs, address, count)
    }

    pub fn read_holding_registers(&self, address: u16, count: usize) -> ModbusResult<Vec<u16>> {
        read_space(
            DataSpace::HoldingRegisters,
            &self.holding_registers,
            address,
            count,
        )
    }

    pub fn read_input_registers(&self, address: u16, count: usize) -> ModbusResult<Vec<u16>> {
        read_space(DataSpace::InputRegisters, &self.input_registers, address, count)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub fn write_coils(
        &self,
        address: u16,
        values: &[bool],
        info: Option<&ServerInfo<'_>>,
    ) -> ModbusResult<()> {
        let changes = write_space(DataSpace::Coils, &self.coils, address, values)?;
        if !changes.is_empty() {
            for observer in self.observers_snapshot() {
                for &(addr, from, to) in &changes {
                    observer.on_coil_change(addr, from, to, info);
                }
            }
        }
        Ok(())
    }

    pub fn write_holding_registers(
        &self,
        address: u16,
        values: &[u16],
        info: Option<&ServerInfo<'_>>,
    ) -> ModbusResult<()> {
        let changes = write_space(
            DataSpace::HoldingRegisters,
            &self.holding_registers,
            address,
            values,
        )?;
        if !changes.is_empty() {
            for observer in self.observers_snapshot() {
                for &(addr, from, to) in &changes {
                    observer.on_holding_register_change(addr, from, to, info);
                }
            }
        }
        Ok(())
    }

    /// Device-side update of discrete inputs
    pub fn write_discrete_inputs(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        write_space(DataSpace::DiscreteInputs, &self.discrete_inputs, address, values).map(|_| ())
    }

    /// Device-side update of input registers
    pub fn write_input_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        write_space(DataSpace::InputRegisters, &self.input_registers, address, values).map(|_| ())
    }

    fn observers_snapshot(&self) -> Vec<Arc<dyn ChangeObserver>> {
        match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn lock_space<T>(space: DataSpace, lock: &Mutex<Vec<T>>) -> ModbusResult<MutexGuard<'_, Vec<T>>> {
    lock.lock()
        .map_err(|_| ModbusError::internal(format!("{space} lock poisoned")))
}

fn lock_len<T>(lock: &Mutex<Vec<T>>) -> usize {
    match lock.lock() {
        Ok(values) => values.len(),
        Err(poisoned) => poisoned.into_inner().len(),
    }
}

fn check_range(space: DataSpace, address: u16, count: usize, size: usize) -> ModbusResult<usize> {
    let start = usize::from(address);
    if start + count > size {
        return Err(ModbusError::Address {
            space,
            address,
            count,
            size,
        });
    }
    Ok(start)
}

fn read_space<T: Copy>(
    space: DataSpace,
    lock: &Mutex<Vec<T>>,
    address: u16,
    count: usize,
) -> ModbusResult<Vec<T>> {
    let values = lock_space(space, lock)?;
    let start = check_range(space, address, count, values.len())?;
    Ok(values[start..start + count].to_vec())
}

/// Store `new` and return the indices that changed; the lock is dropped on return
fn write_space<T: Copy + PartialEq + fmt::Debug>(
    space: DataSpace,
    lock: &Mutex<Vec<T>>,
    address: u16,
    new: &[T],
) -> ModbusResult<Vec<Change<T>>> {
    let mut values = lock_space(space, lock)?;
    let start = check_range(space, address, new.len(), values.len())?;
    let mut changes = Vec::new();
    for (offset, (slot, &value)) in values[start..start + new.len()]
        .iter_mut()
        .zip(new)
        .enumerate()
    {
        if *slot != value {
            changes.push(((start + offset) as u16, *slot, value));
            *slot = value;
        }
    }
    trace!(
        "{} write @{} x{}: {} changed",
        space,
        address,
        new.len(),
        changes.len()
    );
    Ok(changes)
}
