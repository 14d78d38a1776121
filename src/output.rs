//! Binary results file
//!
//! Record layout:
//!
//! ```text
//! magic(i32) | version(i32) | flow_units(i32) |
//! counts{gage, subcatch, node, link, pollutant}(5 × i32) |
//! property lists | id strings |
//! per-period records {
//!     date(f64 decimal days),
//!     subcatch[Nsub][9], node[Nnode][7], link[Nlink][6], system[15]
//! } |
//! offsets | magic
//! ```
//!
//! All integers and floats are little-endian; values are written in the
//! user's unit system. Downstream tools read elements by index in store
//! order.

use crate::error::{EngineError, Result};
use crate::project::Project;
use crate::units::Quantity;
use chrono::NaiveDateTime;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

pub const MAGIC: i32 = 516_114_522;
pub const VERSION: i32 = 51_015;

pub const SUBCATCH_RESULTS: usize = 9;
pub const NODE_RESULTS: usize = 7;
pub const LINK_RESULTS: usize = 6;
pub const SYS_RESULTS: usize = 15;

/// System-wide values recorded once per reporting period.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResults {
    pub temperature: f64,
    pub rainfall: f64,
    pub snow_depth: f64,
    pub infil: f64,
    pub runoff: f64,
    pub dw_inflow: f64,
    pub gw_inflow: f64,
    pub rdii_inflow: f64,
    pub ext_inflow: f64,
    pub total_inflow: f64,
    pub flooding: f64,
    pub outflow: f64,
    pub storage: f64,
    pub evap: f64,
    pub pet: f64,
}

/// Streams reporting periods into the results file.
#[derive(Debug)]
pub struct OutputWriter {
    file: BufWriter<File>,
    results_offset: u64,
    periods: i32,
}

fn write_i32(w: &mut impl Write, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64(w: &mut impl Write, v: f64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_id(w: &mut impl Write, id: &str) -> Result<()> {
    write_i32(w, id.len() as i32)?;
    w.write_all(id.as_bytes())?;
    Ok(())
}

/// Days since the classic epoch (Dec 30, 1899), the date stamp format
/// downstream readers expect.
fn decimal_days(t: NaiveDateTime) -> f64 {
    let epoch = chrono::NaiveDate::from_ymd_opt(1899, 12, 30)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    (t - epoch).num_seconds() as f64 / 86400.0
}

impl OutputWriter {
    /// Create the file and write the header, property lists, and ids.
    pub fn create(path: &Path, project: &Project) -> Result<OutputWriter> {
        let file = File::create(path).map_err(|e| EngineError::OutFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut w = BufWriter::new(file);
        let uc = &project.units;

        write_i32(&mut w, MAGIC)?;
        write_i32(&mut w, VERSION)?;
        write_i32(&mut w, project.options.flow_units as i32)?;
        write_i32(&mut w, project.gages.len() as i32)?;
        write_i32(&mut w, project.subcatchments.len() as i32)?;
        write_i32(&mut w, project.nodes.len() as i32)?;
        write_i32(&mut w, project.links.len() as i32)?;
        write_i32(&mut w, project.pollutants.len() as i32)?;

        // property lists: one static descriptor per element
        for s in &project.subcatchments {
            write_f64(&mut w, uc.to_user(Quantity::LandArea, s.area))?;
        }
        for n in &project.nodes {
            write_i32(&mut w, node_type_code(n))?;
            write_f64(&mut w, uc.to_user(Quantity::Length, n.invert))?;
            write_f64(&mut w, uc.to_user(Quantity::Length, n.full_depth))?;
        }
        for l in &project.links {
            write_i32(&mut w, link_type_code(l))?;
            write_f64(&mut w, uc.to_user(Quantity::Length, l.offset1))?;
            write_f64(&mut w, uc.to_user(Quantity::Length, l.offset2))?;
            write_f64(&mut w, uc.to_user(Quantity::Length, l.xsect.yfull))?;
        }

        // id strings in store order
        for g in &project.gages {
            write_id(&mut w, &g.id)?;
        }
        for s in &project.subcatchments {
            write_id(&mut w, &s.id)?;
        }
        for n in &project.nodes {
            write_id(&mut w, &n.id)?;
        }
        for l in &project.links {
            write_id(&mut w, &l.id)?;
        }
        for p in &project.pollutants {
            write_id(&mut w, &p.id)?;
        }
        w.flush()?;
        let results_offset = w.stream_position()?;

        Ok(OutputWriter {
            file: w,
            results_offset,
            periods: 0,
        })
    }

    /// Append one reporting period.
    pub fn save_period(
        &mut self,
        project: &Project,
        date: NaiveDateTime,
        system: &SystemResults,
    ) -> Result<()> {
        let uc = &project.units;
        let w = &mut self.file;
        write_f64(w, decimal_days(date))?;

        for s in &project.subcatchments {
            let values = [
                uc.to_user(Quantity::Rainfall, s.rainfall),
                0.0, // snow depth is reported at system level
                uc.to_user(Quantity::Flow, s.evap_loss),
                uc.to_user(Quantity::Flow, s.infil_loss),
                uc.to_user(Quantity::Flow, s.new_runoff),
                0.0, // groundwater flow
                0.0, // groundwater elevation
                0.0, // soil moisture
                s.washoff_load.first().copied().unwrap_or(0.0),
            ];
            debug_assert_eq!(values.len(), SUBCATCH_RESULTS);
            for v in values {
                write_f64(w, v)?;
            }
        }

        for n in &project.nodes {
            let values = [
                uc.to_user(Quantity::Length, n.new_depth),
                uc.to_user(Quantity::Length, n.head()),
                uc.to_user(Quantity::Volume, n.new_volume),
                uc.to_user(Quantity::Flow, n.new_lat_flow),
                uc.to_user(Quantity::Flow, n.inflow),
                uc.to_user(Quantity::Flow, n.overflow),
                n.new_qual.first().copied().unwrap_or(0.0),
            ];
            debug_assert_eq!(values.len(), NODE_RESULTS);
            for v in values {
                write_f64(w, v)?;
            }
        }

        for l in &project.links {
            let area = l.xsect.area_of_depth(l.new_depth);
            let velocity = if area > crate::units::FUDGE {
                l.new_flow.abs() / area
            } else {
                0.0
            };
            let capacity = if l.xsect.afull > 0.0 {
                (area / l.xsect.afull).min(1.0)
            } else {
                0.0
            };
            let values = [
                uc.to_user(Quantity::Flow, l.new_flow * l.direction as f64),
                uc.to_user(Quantity::Length, l.new_depth),
                uc.to_user(Quantity::Length, velocity),
                uc.to_user(Quantity::Volume, l.new_volume),
                capacity,
                l.new_qual.first().copied().unwrap_or(0.0),
            ];
            debug_assert_eq!(values.len(), LINK_RESULTS);
            for v in values {
                write_f64(w, v)?;
            }
        }

        let sys = [
            system.temperature,
            uc.to_user(Quantity::Rainfall, system.rainfall),
            uc.to_user(Quantity::RainDepth, system.snow_depth),
            uc.to_user(Quantity::Flow, system.infil),
            uc.to_user(Quantity::Flow, system.runoff),
            uc.to_user(Quantity::Flow, system.dw_inflow),
            uc.to_user(Quantity::Flow, system.gw_inflow),
            uc.to_user(Quantity::Flow, system.rdii_inflow),
            uc.to_user(Quantity::Flow, system.ext_inflow),
            uc.to_user(Quantity::Flow, system.total_inflow),
            uc.to_user(Quantity::Flow, system.flooding),
            uc.to_user(Quantity::Flow, system.outflow),
            uc.to_user(Quantity::Volume, system.storage),
            uc.to_user(Quantity::EvapRate, system.evap),
            uc.to_user(Quantity::EvapRate, system.pet),
        ];
        debug_assert_eq!(sys.len(), SYS_RESULTS);
        for v in sys {
            write_f64(w, v)?;
        }

        self.periods += 1;
        Ok(())
    }

    /// Write the closing offsets block and final magic.
    pub fn close(mut self) -> Result<()> {
        let offset = self.results_offset as i32;
        write_i32(&mut self.file, offset)?;
        write_i32(&mut self.file, self.periods)?;
        write_i32(&mut self.file, MAGIC)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn periods(&self) -> i32 {
        self.periods
    }
}

fn node_type_code(n: &crate::node::Node) -> i32 {
    use crate::node::NodeKind::*;
    match n.kind {
        Junction => 0,
        Outfall(_) => 1,
        Storage(_) => 2,
        Divider(_) => 3,
    }
}

fn link_type_code(l: &crate::link::Link) -> i32 {
    use crate::link::LinkKind::*;
    match l.kind {
        Conduit(_) => 0,
        Pump(_) => 1,
        Orifice(_) => 2,
        Weir(_) => 3,
        Outlet(_) => 4,
    }
}

impl OutputWriter {
    /// Byte offset where period records begin, for readers.
    pub fn results_offset(&self) -> u64 {
        self.results_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;
    use std::io::Read;

    fn project() -> Project {
        let json = r#"{
            "options": {
                "flow_units": "CFS",
                "start": "2024-06-01T00:00:00",
                "end": "2024-06-01T06:00:00"
            },
            "nodes": [
                {"id": "J1", "kind": "junction", "invert": 100.0, "full_depth": 10.0},
                {"id": "O1", "kind": "outfall", "boundary": "free", "invert": 99.0}
            ],
            "links": [{
                "id": "C1", "type": "conduit", "from_node": "J1", "to_node": "O1",
                "length": 400.0, "roughness": 0.013,
                "shape": {"shape": "circular", "diameter": 2.0}
            }]
        }"#;
        let mut p = Project::from_json(json).unwrap();
        for n in &mut p.nodes {
            n.initialize(0, None);
        }
        for l in &mut p.links {
            l.initialize(0);
        }
        p
    }

    #[test]
    fn file_opens_and_closes_with_magic_numbers() {
        let p = project();
        let dir = std::env::temp_dir();
        let path = dir.join("stormflow_out_test.out");
        let mut writer = OutputWriter::create(&path, &p).unwrap();
        writer
            .save_period(&p, p.options.start, &SystemResults::default())
            .unwrap();
        writer
            .save_period(&p, p.options.end, &SystemResults::default())
            .unwrap();
        writer.close().unwrap();

        let mut bytes = Vec::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        let head = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let tail = i32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(head, MAGIC);
        assert_eq!(tail, MAGIC);
        let periods = i32::from_le_bytes(
            bytes[bytes.len() - 8..bytes.len() - 4].try_into().unwrap(),
        );
        assert_eq!(periods, 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn period_record_size_is_fixed() {
        let p = project();
        let dir = std::env::temp_dir();
        let path = dir.join("stormflow_out_size_test.out");
        let mut writer = OutputWriter::create(&path, &p).unwrap();
        let before = writer.results_offset();
        writer
            .save_period(&p, p.options.start, &SystemResults::default())
            .unwrap();
        writer.file.flush().unwrap();
        let after = writer.file.stream_position().unwrap();
        let expected = 8 // date
            + 8 * (p.subcatchments.len() * SUBCATCH_RESULTS
                + p.nodes.len() * NODE_RESULTS
                + p.links.len() * LINK_RESULTS
                + SYS_RESULTS);
        assert_eq!((after - before) as usize, expected);
        writer.close().unwrap();
        std::fs::remove_file(&path).ok();
    }
}
