//! Inverter register layout (SUN2000-style input registers).
//!
//! Telemetry is read as one contiguous input-register block per poll and
//! every field is projected from its offset within that block. A field whose
//! offset falls outside the returned block decodes to `None`.

use solcharge_core::TelemetrySnapshot;

/// First register of the telemetry block
pub const INPUT_BLOCK_START: u16 = 32069;
/// Registers read per poll
pub const INPUT_BLOCK_LEN: u16 = 50;

/// Telemetry fields carried by the input block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryField {
    VoltageDc,
    CurrentDc,
    VoltageAc,
    CurrentAc,
    PowerKw,
    Frequency,
    Efficiency,
    Temperature,
    TotalEnergy,
    DailyEnergy,
}

/// One input-register mapping: address, scale divisor, signedness
#[derive(Debug, Clone, Copy)]
pub struct RegisterDef {
    pub field: TelemetryField,
    pub address: u16,
    pub scale: f64,
    pub signed: bool,
}

/// The full telemetry map. Power is reported in W and scaled straight to kW.
pub const INPUT_REGISTERS: &[RegisterDef] = &[
    RegisterDef { field: TelemetryField::VoltageDc, address: 32069, scale: 10.0, signed: false },
    RegisterDef { field: TelemetryField::CurrentDc, address: 32070, scale: 100.0, signed: false },
    RegisterDef { field: TelemetryField::VoltageAc, address: 32073, scale: 10.0, signed: false },
    RegisterDef { field: TelemetryField::CurrentAc, address: 32076, scale: 100.0, signed: false },
    RegisterDef { field: TelemetryField::PowerKw, address: 32080, scale: 1000.0, signed: false },
    RegisterDef { field: TelemetryField::Frequency, address: 32085, scale: 100.0, signed: false },
    RegisterDef { field: TelemetryField::Efficiency, address: 32086, scale: 100.0, signed: false },
    RegisterDef { field: TelemetryField::Temperature, address: 32087, scale: 10.0, signed: true },
    RegisterDef { field: TelemetryField::TotalEnergy, address: 32106, scale: 100.0, signed: false },
    RegisterDef { field: TelemetryField::DailyEnergy, address: 32114, scale: 100.0, signed: false },
];

/// Holding registers that accept writes through `set_parameter`. For writes
/// the scale multiplies: raw = value * scale.
#[derive(Debug, Clone, Copy)]
pub struct WritableDef {
    pub name: &'static str,
    pub address: u16,
    pub scale: f64,
}

/// Most of the SUN2000 map is read-only; active power derating is the one
/// knob the fleet exposes.
pub const WRITABLE_REGISTERS: &[WritableDef] = &[WritableDef {
    name: "power_limit_pct",
    address: 40125,
    scale: 10.0,
}];

/// Look up a writable register by parameter name
pub fn writable_register(name: &str) -> Option<&'static WritableDef> {
    WRITABLE_REGISTERS.iter().find(|def| def.name == name)
}

/// Decode one field from the block; `None` when its offset lies outside
pub fn decode_register(block: &[u16], def: &RegisterDef) -> Option<f64> {
    let offset = def.address.checked_sub(INPUT_BLOCK_START)? as usize;
    let raw = *block.get(offset)?;
    let value = if def.signed && raw > i16::MAX as u16 {
        f64::from(raw) - 65536.0
    } else {
        f64::from(raw)
    };
    Some(value / def.scale)
}

/// Project every mapped field out of a returned block
pub fn decode_block(block: &[u16]) -> TelemetrySnapshot {
    let mut snapshot = TelemetrySnapshot::default();
    for def in INPUT_REGISTERS {
        let value = decode_register(block, def);
        match def.field {
            TelemetryField::VoltageDc => snapshot.voltage_dc = value,
            TelemetryField::CurrentDc => snapshot.current_dc = value,
            TelemetryField::VoltageAc => snapshot.voltage_ac = value,
            TelemetryField::CurrentAc => snapshot.current_ac = value,
            TelemetryField::PowerKw => snapshot.power_kw = value,
            TelemetryField::Frequency => snapshot.frequency_hz = value,
            TelemetryField::Efficiency => snapshot.efficiency_pct = value,
            TelemetryField::Temperature => snapshot.temperature_c = value,
            TelemetryField::TotalEnergy => snapshot.total_energy_kwh = value,
            TelemetryField::DailyEnergy => snapshot.daily_energy_kwh = value,
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(values: &[(u16, u16)]) -> Vec<u16> {
        let mut block = vec![0u16; INPUT_BLOCK_LEN as usize];
        for (address, raw) in values {
            block[(*address - INPUT_BLOCK_START) as usize] = *raw;
        }
        block
    }

    #[test]
    fn test_decode_full_block() {
        let block = block_with(&[
            (32069, 6200), // 620.0 V DC
            (32070, 845),  // 8.45 A DC
            (32073, 2301), // 230.1 V AC
            (32080, 5000), // 5.000 kW
            (32085, 5002), // 50.02 Hz
            (32086, 9815), // 98.15 %
            (32087, 412),  // 41.2 C
            (32106, 8250), // 82.50 kWh lifetime
        ]);
        let snapshot = decode_block(&block);
        assert_eq!(snapshot.voltage_dc, Some(620.0));
        assert_eq!(snapshot.current_dc, Some(8.45));
        assert_eq!(snapshot.voltage_ac, Some(230.1));
        assert_eq!(snapshot.power_kw, Some(5.0));
        assert_eq!(snapshot.frequency_hz, Some(50.02));
        assert_eq!(snapshot.efficiency_pct, Some(98.15));
        assert_eq!(snapshot.temperature_c, Some(41.2));
        assert_eq!(snapshot.total_energy_kwh, Some(82.5));
    }

    #[test]
    fn test_signed_temperature() {
        // -10.0 C encodes as two's complement
        let raw = (-100i16) as u16;
        let block = block_with(&[(32087, raw)]);
        let snapshot = decode_block(&block);
        assert_eq!(snapshot.temperature_c, Some(-10.0));
    }

    #[test]
    fn test_short_block_decodes_to_unknown() {
        // Only the first 20 registers returned: daily/total energy are out
        let block = vec![0u16; 20];
        let snapshot = decode_block(&block);
        assert_eq!(snapshot.voltage_dc, Some(0.0));
        assert_eq!(snapshot.temperature_c, Some(0.0));
        assert_eq!(snapshot.total_energy_kwh, None);
        assert_eq!(snapshot.daily_energy_kwh, None);
    }

    #[test]
    fn test_empty_block_is_all_unknown() {
        let snapshot = decode_block(&[]);
        assert_eq!(snapshot, TelemetrySnapshot::default());
    }

    #[test]
    fn test_writable_lookup() {
        assert!(writable_register("power_limit_pct").is_some());
        assert!(writable_register("grid_frequency").is_none());
    }
}
