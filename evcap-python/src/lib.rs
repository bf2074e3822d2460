//! Python bindings for the evcap decoders with numpy support.
//!
//! Raw captures of either wire protocol are run through the same pipeline as
//! a live device (decoder, container generator, exchange) and the delivered
//! containers are flattened into columnar numpy arrays.

use evcap_core::types::full_timestamp;
use evcap_core::{
    Container, DataExchange, FrameDecoder, ImuOrientation, Notifications, PackedDecoder,
    Producer, ProducerStats, ProtocolDecoder, SensorGeometry, SessionConfig,
};
use numpy::{IntoPyArray, PyArray1};
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Full timestamp reported for wrap and reset markers.
const MARKER_TIMESTAMP: i64 = -1;

/// Decoded polarity events in columnar form.
#[pyclass]
#[derive(Default)]
pub struct Events {
    x: Vec<u16>,
    y: Vec<u16>,
    /// 0 = OFF, 1 = ON
    polarity: Vec<u8>,
    /// Full timestamps in microseconds
    timestamp: Vec<i64>,
    sensor_width: u32,
    sensor_height: u32,
}

#[pymethods]
impl Events {
    fn __len__(&self) -> usize {
        self.x.len()
    }

    fn __repr__(&self) -> String {
        format!(
            "Events(count={}, sensor={}x{})",
            self.x.len(),
            self.sensor_width,
            self.sensor_height
        )
    }

    #[getter]
    fn x<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.x.clone().into_pyarray(py)
    }

    #[getter]
    fn y<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.y.clone().into_pyarray(py)
    }

    /// Values: 0 = OFF (decrease in brightness), 1 = ON (increase)
    #[getter]
    fn polarity<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.polarity.clone().into_pyarray(py)
    }

    #[getter]
    fn p<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.polarity.clone().into_pyarray(py)
    }

    /// Full timestamps in microseconds, monotonic across counter wraps.
    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i64> {
        self.timestamp.clone().into_pyarray(py)
    }

    #[getter]
    fn t<'py>(&self, py: Python<'py>) -> &'py PyArray1<i64> {
        self.timestamp.clone().into_pyarray(py)
    }

    #[getter]
    fn sensor_size(&self) -> (u32, u32) {
        (self.sensor_width, self.sensor_height)
    }

    /// Returns all arrays as a dictionary, e.g. for a pandas DataFrame.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<PyObject> {
        let dict = PyDict::new(py);
        dict.set_item("x", self.x.clone().into_pyarray(py))?;
        dict.set_item("y", self.y.clone().into_pyarray(py))?;
        dict.set_item("polarity", self.polarity.clone().into_pyarray(py))?;
        dict.set_item("timestamp", self.timestamp.clone().into_pyarray(py))?;
        Ok(dict.into())
    }
}

/// Special events: external input edges and timestamp markers.
#[pyclass]
#[derive(Default)]
pub struct SpecialEvents {
    /// Numeric event type (0 wrap, 1 reset, 2..4 input, 16/17 generator)
    kind: Vec<u8>,
    /// Full timestamps; -1 for wrap and reset markers
    timestamp: Vec<i64>,
}

#[pymethods]
impl SpecialEvents {
    fn __len__(&self) -> usize {
        self.kind.len()
    }

    #[getter]
    fn kind<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.kind.clone().into_pyarray(py)
    }

    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i64> {
        self.timestamp.clone().into_pyarray(py)
    }
}

/// IMU samples: accelerations in g, angular rates in °/s, temperature in °C.
#[pyclass]
#[derive(Default)]
pub struct ImuSamples {
    timestamp: Vec<i64>,
    accel: [Vec<f32>; 3],
    gyro: [Vec<f32>; 3],
    temperature: Vec<f32>,
}

#[pymethods]
impl ImuSamples {
    fn __len__(&self) -> usize {
        self.timestamp.len()
    }

    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i64> {
        self.timestamp.clone().into_pyarray(py)
    }

    #[getter]
    fn temperature<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.temperature.clone().into_pyarray(py)
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<PyObject> {
        let dict = PyDict::new(py);
        dict.set_item("timestamp", self.timestamp.clone().into_pyarray(py))?;
        for (axis, name) in ["x", "y", "z"].iter().enumerate() {
            dict.set_item(format!("accel_{name}"), self.accel[axis].clone().into_pyarray(py))?;
            dict.set_item(format!("gyro_{name}"), self.gyro[axis].clone().into_pyarray(py))?;
        }
        dict.set_item("temperature", self.temperature.clone().into_pyarray(py))?;
        Ok(dict.into())
    }
}

/// Everything delivered for one capture.
#[pyclass]
pub struct Recording {
    #[pyo3(get)]
    events: Py<Events>,
    #[pyo3(get)]
    special: Py<SpecialEvents>,
    #[pyo3(get)]
    imu: Py<ImuSamples>,
    #[pyo3(get)]
    containers: u64,
    stats: ProducerStats,
}

#[pymethods]
impl Recording {
    /// Producer counters (bytes, skipped bytes, dropped containers, ...).
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<PyObject> {
        let s = self.stats;
        let dict = PyDict::new(py);
        dict.set_item("bytes", s.bytes)?;
        dict.set_item("symbols", s.symbols)?;
        dict.set_item("skipped_bytes", s.skipped_bytes)?;
        dict.set_item("truncated_bytes", s.truncated_bytes)?;
        dict.set_item("containers_delivered", s.containers_delivered)?;
        dict.set_item("containers_dropped", s.containers_dropped)?;
        dict.set_item("resets", s.resets)?;
        dict.set_item("big_wraps", s.big_wraps)?;
        Ok(dict.into())
    }
}

#[derive(Default)]
struct Collected {
    events: Events,
    special: SpecialEvents,
    imu: ImuSamples,
    containers: u64,
}

impl Collected {
    fn push(&mut self, container: Container) {
        self.containers += 1;
        let (special, polarity, imu6) = container.into_parts();

        if let Some(buffer) = polarity {
            let overflow = buffer.ts_overflow();
            for event in buffer.into_events() {
                self.events.x.push(event.x);
                self.events.y.push(event.y);
                self.events.polarity.push(u8::from(event.polarity));
                self.events
                    .timestamp
                    .push(full_timestamp(overflow, event.timestamp));
            }
        }

        if let Some(buffer) = special {
            let overflow = buffer.ts_overflow();
            for event in buffer.into_events() {
                self.special.kind.push(event.kind as u8);
                self.special.timestamp.push(if event.timestamp == i32::MAX {
                    MARKER_TIMESTAMP
                } else {
                    full_timestamp(overflow, event.timestamp)
                });
            }
        }

        if let Some(buffer) = imu6 {
            let overflow = buffer.ts_overflow();
            for sample in buffer.into_events() {
                self.imu
                    .timestamp
                    .push(full_timestamp(overflow, sample.timestamp));
                let accel = [sample.accel_x, sample.accel_y, sample.accel_z];
                let gyro = [sample.gyro_x, sample.gyro_y, sample.gyro_z];
                for axis in 0..3 {
                    self.imu.accel[axis].push(accel[axis]);
                    self.imu.gyro[axis].push(gyro[axis]);
                }
                self.imu.temperature.push(sample.temperature);
            }
        }
    }
}

fn pipeline_config(max_packet_size: u32, max_interval: u32) -> PyResult<SessionConfig> {
    SessionConfig::builder("python")
        .max_packet_size(max_packet_size)
        .max_interval(max_interval)
        .exchange_size(u32::from(u16::MAX))
        .build()
        .map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Feeds `data` in chunks while a consumer thread drains the exchange.
fn run<D: ProtocolDecoder>(
    decoder: D,
    data: &[u8],
    chunk_size: usize,
    config: &SessionConfig,
) -> std::io::Result<(Collected, ProducerStats)> {
    let geometry = decoder.geometry();
    let exchange = Arc::new(DataExchange::new(Arc::clone(&config.exchange)));
    exchange.init(Notifications::new());

    let mut producer = Producer::new(
        decoder,
        Arc::clone(&config.packets),
        Arc::clone(&exchange),
        Arc::new(AtomicBool::new(true)),
        Arc::clone(&config.log),
    );
    producer.start();

    let mut collected = Collected::default();
    collected.events.sensor_width = u32::from(geometry.width());
    collected.events.sensor_height = u32::from(geometry.height());

    producer.replay(data.chunks(chunk_size.max(1)), |container| {
        collected.push(container)
    })?;

    Ok((collected, producer.stats()))
}

fn replay_failed(error: std::io::Error) -> PyErr {
    PyIOError::new_err(format!("Failed to start replay consumer: {}", error))
}

fn into_recording(py: Python<'_>, collected: Collected, stats: ProducerStats) -> PyResult<Py<Recording>> {
    let recording = Recording {
        events: Py::new(py, collected.events)?,
        special: Py::new(py, collected.special)?,
        imu: Py::new(py, collected.imu)?,
        containers: collected.containers,
        stats,
    };
    Py::new(py, recording)
}

/// Decodes packed 16-bit word data (DV Explorer class cameras).
///
/// Args:
///     data: Raw little-endian words
///     columns, rows: Sensor geometry as sent on the wire
///     invert_xy: Swap X and Y on output
///     imu_orientation: Device IMU flip bits (bit 2 X, bit 1 Y, bit 0 Z)
///
/// Example:
///     >>> import evcap
///     >>> rec = evcap.decode_packed(open("capture.raw", "rb").read())
///     >>> x = rec.events.x
#[pyfunction]
#[pyo3(signature = (
    data,
    columns=640,
    rows=480,
    invert_xy=false,
    imu_orientation=0,
    max_packet_size=4096,
    max_interval=10000,
    chunk_size=8192
))]
#[allow(clippy::too_many_arguments)]
fn decode_packed(
    py: Python<'_>,
    data: &[u8],
    columns: u16,
    rows: u16,
    invert_xy: bool,
    imu_orientation: u32,
    max_packet_size: u32,
    max_interval: u32,
    chunk_size: usize,
) -> PyResult<Py<Recording>> {
    let config = pipeline_config(max_packet_size, max_interval)?;
    let mut geometry = SensorGeometry::new(columns, rows);
    geometry.invert_xy = invert_xy;
    let decoder = PackedDecoder::new(geometry, ImuOrientation::from_bits(imu_orientation));

    let (collected, stats) = py
        .allow_threads(|| run(decoder, data, chunk_size, &config))
        .map_err(replay_failed)?;
    into_recording(py, collected, stats)
}

/// Decodes 4-byte serial frames (eDVS class devices).
#[pyfunction]
#[pyo3(signature = (data, max_packet_size=4096, max_interval=10000, chunk_size=1024))]
fn decode_frames(
    py: Python<'_>,
    data: &[u8],
    max_packet_size: u32,
    max_interval: u32,
    chunk_size: usize,
) -> PyResult<Py<Recording>> {
    let config = pipeline_config(max_packet_size, max_interval)?;
    let (collected, stats) = py
        .allow_threads(|| run(FrameDecoder::default(), data, chunk_size, &config))
        .map_err(replay_failed)?;
    into_recording(py, collected, stats)
}

/// Decodes a capture file of the given protocol ("packed" or "frame").
#[pyfunction]
#[pyo3(signature = (path, protocol="packed"))]
fn decode_file(py: Python<'_>, path: &str, protocol: &str) -> PyResult<Py<Recording>> {
    let data = std::fs::read(path)
        .map_err(|e| PyIOError::new_err(format!("Failed to read file: {}", e)))?;

    match protocol {
        "packed" => decode_packed(py, &data, 640, 480, false, 0, 4096, 10_000, 8192),
        "frame" => decode_frames(py, &data, 4096, 10_000, 1024),
        other => Err(PyValueError::new_err(format!(
            "Unknown protocol: {other}. Use \"packed\" or \"frame\""
        ))),
    }
}

/// evcap decoder module for Python.
#[pymodule]
fn evcap(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decode_packed, m)?)?;
    m.add_function(wrap_pyfunction!(decode_frames, m)?)?;
    m.add_function(wrap_pyfunction!(decode_file, m)?)?;
    m.add_class::<Events>()?;
    m.add_class::<SpecialEvents>()?;
    m.add_class::<ImuSamples>()?;
    m.add_class::<Recording>()?;
    Ok(())
}
