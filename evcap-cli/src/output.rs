//! CSV text dumps of delivered containers.
//!
//! Timestamps are written as full 64-bit microsecond values, so output stays
//! monotonic across big wraps.

use evcap_core::types::full_timestamp;
use evcap_core::{Container, EventBuffer, Imu6Event, PolarityEvent, SpecialEvent, SensorGeometry};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("polarity table columns {columns:?}: {reason}")]
    Columns { columns: String, reason: String },
}

/// One column of the polarity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolarityColumn {
    X,
    Y,
    Polarity,
    Timestamp,
}

impl PolarityColumn {
    pub fn name(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Polarity => "polarity",
            Self::Timestamp => "timestamp",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "x" => Some(Self::X),
            "y" => Some(Self::Y),
            "p" | "pol" | "polarity" => Some(Self::Polarity),
            "t" | "ts" | "timestamp" => Some(Self::Timestamp),
            _ => None,
        }
    }

    fn value(self, event: &PolarityEvent, overflow: i32) -> i64 {
        match self {
            Self::X => i64::from(event.x),
            Self::Y => i64::from(event.y),
            Self::Polarity => i64::from(event.polarity),
            Self::Timestamp => full_timestamp(overflow, event.timestamp),
        }
    }
}

/// Column order of the polarity table; every column appears exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolarityColumns([PolarityColumn; 4]);

impl Default for PolarityColumns {
    fn default() -> Self {
        use PolarityColumn::*;
        Self([X, Y, Polarity, Timestamp])
    }
}

impl std::str::FromStr for PolarityColumns {
    type Err = OutputError;

    /// Parses a comma-separated column list such as "x,y,p,t" or "t,x,y,p".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| OutputError::Columns {
            columns: s.to_string(),
            reason,
        };

        let mut columns = Vec::with_capacity(4);
        for name in s.split(',').map(|name| name.trim().to_ascii_lowercase()) {
            let column = PolarityColumn::parse(&name)
                .ok_or_else(|| invalid(format!("unknown column {name:?}, expected x, y, p or t")))?;
            if columns.contains(&column) {
                return Err(invalid(format!("{} listed twice", column.name())));
            }
            columns.push(column);
        }

        let columns: [PolarityColumn; 4] = columns.try_into().map_err(|columns: Vec<_>| {
            invalid(format!("{} columns given, all of x, y, p, t are needed", columns.len()))
        })?;
        Ok(Self(columns))
    }
}

impl PolarityColumns {
    /// Header line of the polarity table.
    pub fn header(&self) -> String {
        self.0.map(PolarityColumn::name).join(",")
    }

    fn row(&self, event: &PolarityEvent, overflow: i32) -> [i64; 4] {
        self.0.map(|column| column.value(event, overflow))
    }
}

/// Rows written per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub polarity: u64,
    pub special: u64,
    pub imu6: u64,
}

/// Writes polarity, special and IMU tables side by side.
pub struct ContainerCsvWriter<W: Write> {
    polarity: BufWriter<W>,
    special: BufWriter<W>,
    imu6: BufWriter<W>,
    columns: PolarityColumns,
    counts: RowCounts,
}

impl ContainerCsvWriter<File> {
    /// Creates `<stem>_polarity.csv`, `<stem>_special.csv` and `<stem>_imu6.csv` in `dir`.
    pub fn create(dir: &Path, stem: &str, columns: PolarityColumns) -> Result<Self, OutputError> {
        let open = |kind: &str| -> Result<File, OutputError> {
            Ok(File::create(table_path(dir, stem, kind))?)
        };
        Ok(Self::new(
            open("polarity")?,
            open("special")?,
            open("imu6")?,
            columns,
        ))
    }
}

/// Output path of one table.
pub fn table_path(dir: &Path, stem: &str, kind: &str) -> PathBuf {
    dir.join(format!("{stem}_{kind}.csv"))
}

impl<W: Write> ContainerCsvWriter<W> {
    pub fn new(polarity: W, special: W, imu6: W, columns: PolarityColumns) -> Self {
        Self {
            polarity: BufWriter::new(polarity),
            special: BufWriter::new(special),
            imu6: BufWriter::new(imu6),
            columns,
            counts: RowCounts::default(),
        }
    }

    /// Writes the table headers, with the sensor geometry on the polarity table.
    pub fn write_headers(&mut self, geometry: SensorGeometry) -> Result<(), OutputError> {
        writeln!(
            self.polarity,
            "%geometry:{},{}",
            geometry.width(),
            geometry.height()
        )?;
        writeln!(self.polarity, "{}", self.columns.header())?;
        writeln!(self.special, "timestamp,type")?;
        writeln!(
            self.imu6,
            "timestamp,accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,temperature"
        )?;
        Ok(())
    }

    /// Writes every event of one container.
    pub fn write_container(&mut self, container: &Container) -> Result<(), OutputError> {
        if let Some(buffer) = container.polarity() {
            self.write_polarity(buffer)?;
        }
        if let Some(buffer) = container.special() {
            self.write_special(buffer)?;
        }
        if let Some(buffer) = container.imu6() {
            self.write_imu6(buffer)?;
        }
        Ok(())
    }

    fn write_polarity(&mut self, buffer: &EventBuffer<PolarityEvent>) -> Result<(), OutputError> {
        let overflow = buffer.ts_overflow();
        for event in buffer {
            let [a, b, c, d] = self.columns.row(event, overflow);
            writeln!(self.polarity, "{a},{b},{c},{d}")?;
        }
        self.counts.polarity += buffer.position() as u64;
        Ok(())
    }

    fn write_special(&mut self, buffer: &EventBuffer<SpecialEvent>) -> Result<(), OutputError> {
        let overflow = buffer.ts_overflow();
        for event in buffer {
            // Wrap and reset markers have no time of their own.
            let timestamp = if event.timestamp == i32::MAX {
                String::new()
            } else {
                full_timestamp(overflow, event.timestamp).to_string()
            };
            writeln!(self.special, "{},{:?}", timestamp, event.kind)?;
        }
        self.counts.special += buffer.position() as u64;
        Ok(())
    }

    fn write_imu6(&mut self, buffer: &EventBuffer<Imu6Event>) -> Result<(), OutputError> {
        let overflow = buffer.ts_overflow();
        for event in buffer {
            writeln!(
                self.imu6,
                "{},{},{},{},{},{},{},{}",
                full_timestamp(overflow, event.timestamp),
                event.accel_x,
                event.accel_y,
                event.accel_z,
                event.gyro_x,
                event.gyro_y,
                event.gyro_z,
                event.temperature
            )?;
        }
        self.counts.imu6 += buffer.position() as u64;
        Ok(())
    }

    pub fn counts(&self) -> RowCounts {
        self.counts
    }

    /// Flushes all three tables.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.polarity.flush()?;
        self.special.flush()?;
        self.imu6.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evcap_core::container::CommitTrigger;
    use evcap_core::{ContainerGenerator, PacketSettings, SpecialEventType};
    use std::str::FromStr;
    use std::sync::Arc;

    fn container() -> Container {
        let mut generator = ContainerGenerator::new(Arc::new(PacketSettings::default()));
        let polarity = generator.reserve_polarity(2, 1).unwrap();
        polarity.append(PolarityEvent::new(100, 200, true, 12345));
        polarity.append(PolarityEvent::new(101, 201, false, 12346));
        generator
            .reserve_special(1, 1)
            .unwrap()
            .append(SpecialEvent::marker(SpecialEventType::TimestampWrap));

        generator
            .commit(CommitTrigger::Flush, 0, 1)
            .unwrap()
            .data
            .unwrap()
    }

    fn columns(list: &str) -> PolarityColumns {
        PolarityColumns::from_str(list).unwrap()
    }

    #[test]
    fn test_polarity_columns_parsing() {
        assert_eq!(columns("x,y,p,t"), PolarityColumns::default());
        assert_eq!(columns(" X , Y , Pol , TS "), PolarityColumns::default());
        assert_eq!(columns("t,x,y,p").header(), "timestamp,x,y,polarity");
        assert_eq!(columns("y,x,timestamp,polarity").header(), "y,x,timestamp,polarity");
    }

    #[test]
    fn test_polarity_columns_errors_name_the_list() {
        let unknown = PolarityColumns::from_str("x,y,z,t").unwrap_err().to_string();
        assert!(unknown.starts_with("polarity table columns \"x,y,z,t\""));
        assert!(unknown.contains("unknown column \"z\""));

        let twice = PolarityColumns::from_str("x,t,y,time").unwrap_err().to_string();
        assert!(twice.ends_with("timestamp listed twice"));

        let short = PolarityColumns::from_str("x,y,p").unwrap_err().to_string();
        assert!(short.contains("3 columns given"));
        assert!(PolarityColumns::from_str("x,y,p,t,t").is_err());
    }

    #[test]
    fn test_container_tables() {
        let (mut polarity, mut special, mut imu6) = (Vec::new(), Vec::new(), Vec::new());
        let counts = {
            let mut writer =
                ContainerCsvWriter::new(&mut polarity, &mut special, &mut imu6, columns("t,x,y,p"));
            writer.write_headers(SensorGeometry::new(640, 480)).unwrap();
            writer.write_container(&container()).unwrap();
            writer.flush().unwrap();
            writer.counts()
        };

        let polarity = String::from_utf8(polarity).unwrap();
        assert!(polarity.starts_with("%geometry:640,480\ntimestamp,x,y,polarity\n"));
        assert!(polarity.contains(&format!("{},100,200,1", (1i64 << 31) + 12345)));

        let special = String::from_utf8(special).unwrap();
        assert!(special.ends_with(",TimestampWrap\n"));
        assert_eq!(String::from_utf8(imu6).unwrap().lines().count(), 1);

        assert_eq!(
            counts,
            RowCounts {
                polarity: 2,
                special: 1,
                imu6: 0
            }
        );
    }

    #[test]
    fn test_create_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ContainerCsvWriter::create(dir.path(), "capture", PolarityColumns::default()).unwrap();
        writer.write_headers(SensorGeometry::new(128, 128)).unwrap();
        writer.flush().unwrap();

        let text = std::fs::read_to_string(table_path(dir.path(), "capture", "polarity")).unwrap();
        assert_eq!(text, "%geometry:128,128\nx,y,polarity,timestamp\n");
        assert!(table_path(dir.path(), "capture", "imu6").exists());
    }
}
