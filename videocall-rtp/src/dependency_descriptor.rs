/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! AV1 RTP dependency descriptor header extension.
//!
//! A descriptor carries a 16-bit frame number and refers to a template of a
//! [`FrameDependencyStructure`]. The structure travels attached to the first
//! packet of key frames and stays valid until a newer one replaces it.

use serde::{Deserialize, Serialize};

use crate::bit_io::{BitReader, BitWriter};
use crate::error::{Result, RtpError};

pub const MAX_TEMPLATES: usize = 64;
pub const MAX_SPATIAL_IDS: u8 = 4;
pub const MAX_TEMPORAL_IDS: u8 = 8;
pub const MAX_DECODE_TARGETS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeTargetIndication {
    NotPresent = 0,
    Discardable = 1,
    Switch = 2,
    Required = 3,
}

impl DecodeTargetIndication {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => DecodeTargetIndication::NotPresent,
            1 => DecodeTargetIndication::Discardable,
            2 => DecodeTargetIndication::Switch,
            _ => DecodeTargetIndication::Required,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDependencyTemplate {
    pub spatial_id: u8,
    pub temporal_id: u8,
    pub decode_target_indications: Vec<DecodeTargetIndication>,
    pub frame_diffs: Vec<u32>,
    pub chain_diffs: Vec<u32>,
}

impl FrameDependencyTemplate {
    pub fn new(spatial_id: u8, temporal_id: u8) -> Self {
        Self {
            spatial_id,
            temporal_id,
            ..Default::default()
        }
    }

    pub fn with_dtis(mut self, dtis: &[DecodeTargetIndication]) -> Self {
        self.decode_target_indications = dtis.to_vec();
        self
    }

    pub fn with_frame_diffs(mut self, diffs: &[u32]) -> Self {
        self.frame_diffs = diffs.to_vec();
        self
    }

    pub fn with_chain_diffs(mut self, diffs: &[u32]) -> Self {
        self.chain_diffs = diffs.to_vec();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDependencyStructure {
    /// Template id offset, 0..64.
    pub structure_id: u8,
    pub num_decode_targets: u32,
    pub num_chains: u32,
    pub decode_target_protected_by_chain: Vec<u32>,
    pub resolutions: Vec<RenderResolution>,
    pub templates: Vec<FrameDependencyTemplate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDescriptor {
    pub first_packet_in_frame: bool,
    pub last_packet_in_frame: bool,
    pub frame_number: u16,
    pub frame_dependencies: FrameDependencyTemplate,
    pub resolution: Option<RenderResolution>,
    pub active_decode_targets_bitmask: Option<u32>,
    pub attached_structure: Option<FrameDependencyStructure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextLayerIdc {
    SameLayer = 0,
    NextTemporal = 1,
    NextSpatial = 2,
    NoMoreTemplates = 3,
}

impl DependencyDescriptor {
    /// Parses a descriptor. `structure` is the latest accepted structure and
    /// is required unless the descriptor attaches its own.
    pub fn parse(data: &[u8], structure: Option<&FrameDependencyStructure>) -> Result<Self> {
        let mut reader = BitReader::new(data);
        let mut descriptor = DependencyDescriptor {
            first_packet_in_frame: reader.read_bit()?,
            last_packet_in_frame: reader.read_bit()?,
            ..Default::default()
        };
        let template_id = reader.read_bits(6)?;
        descriptor.frame_number = reader.read_u16()?;

        let mut active_decode_targets_present = false;
        let mut custom_dtis = false;
        let mut custom_fdiffs = false;
        let mut custom_chains = false;
        if data.len() > 3 {
            let structure_present = reader.read_bit()?;
            active_decode_targets_present = reader.read_bit()?;
            custom_dtis = reader.read_bit()?;
            custom_fdiffs = reader.read_bit()?;
            custom_chains = reader.read_bit()?;
            if structure_present {
                let attached = read_structure(&mut reader)?;
                descriptor.active_decode_targets_bitmask =
                    Some(((1u64 << attached.num_decode_targets) - 1) as u32);
                descriptor.attached_structure = Some(attached);
            }
        }

        let structure = descriptor
            .attached_structure
            .as_ref()
            .or(structure)
            .ok_or(RtpError::MissingStructure)?;
        if active_decode_targets_present {
            descriptor.active_decode_targets_bitmask =
                Some(reader.read_bits(structure.num_decode_targets)?);
        }

        let template_index = (template_id as usize + MAX_TEMPLATES
            - structure.structure_id as usize)
            % MAX_TEMPLATES;
        let Some(template) = structure.templates.get(template_index) else {
            return Err(RtpError::MalformedExtension(format!(
                "template index {template_index} out of {} templates",
                structure.templates.len()
            )));
        };
        let mut dependencies = template.clone();

        if custom_dtis {
            for dti in dependencies.decode_target_indications.iter_mut() {
                *dti = DecodeTargetIndication::from_bits(reader.read_bits(2)?);
            }
        }
        if custom_fdiffs {
            dependencies.frame_diffs.clear();
            loop {
                let next_fdiff_size = reader.read_bits(2)?;
                if next_fdiff_size == 0 {
                    break;
                }
                dependencies
                    .frame_diffs
                    .push(reader.read_bits(4 * next_fdiff_size)? + 1);
            }
        }
        if custom_chains {
            for chain_diff in dependencies.chain_diffs.iter_mut() {
                *chain_diff = u32::from(reader.read_u8()?);
            }
        }

        if !structure.resolutions.is_empty() {
            let resolution = structure
                .resolutions
                .get(dependencies.spatial_id as usize)
                .copied()
                .ok_or_else(|| {
                    RtpError::MalformedExtension(format!(
                        "no resolution for spatial id {}",
                        dependencies.spatial_id
                    ))
                })?;
            descriptor.resolution = Some(resolution);
        }
        descriptor.frame_dependencies = dependencies;
        Ok(descriptor)
    }

    /// Serializes the descriptor against `structure`, which is also written
    /// when `attached_structure` is set.
    pub fn write(&self, structure: &FrameDependencyStructure) -> Result<Vec<u8>> {
        validate_structure(structure)?;
        let (template_index, matched) = best_template(&self.frame_dependencies, structure)
            .ok_or_else(|| {
                RtpError::MalformedExtension(format!(
                    "no template for spatial id {} temporal id {}",
                    self.frame_dependencies.spatial_id, self.frame_dependencies.temporal_id
                ))
            })?;
        let template_id = (template_index + structure.structure_id as usize) % MAX_TEMPLATES;
        let custom_dtis =
            matched.decode_target_indications != self.frame_dependencies.decode_target_indications;
        let custom_fdiffs = matched.frame_diffs != self.frame_dependencies.frame_diffs;
        let custom_chains = matched.chain_diffs != self.frame_dependencies.chain_diffs;
        let structure_attached = self.attached_structure.is_some();

        let mut writer = BitWriter::new();
        writer.write_bit(self.first_packet_in_frame);
        writer.write_bit(self.last_packet_in_frame);
        writer.write_bits(template_id as u64, 6);
        writer.write_bits(u64::from(self.frame_number), 16);

        if !(structure_attached || custom_dtis || custom_fdiffs || custom_chains) {
            return Ok(writer.into_bytes());
        }
        writer.write_bit(structure_attached);
        writer.write_bit(false);
        writer.write_bit(custom_dtis);
        writer.write_bit(custom_fdiffs);
        writer.write_bit(custom_chains);
        if structure_attached {
            write_structure(&mut writer, structure);
        }
        if custom_dtis {
            for dti in &self.frame_dependencies.decode_target_indications {
                writer.write_bits(*dti as u64, 2);
            }
        }
        if custom_fdiffs {
            for &fdiff in &self.frame_dependencies.frame_diffs {
                if fdiff == 0 || fdiff > 1 << 12 {
                    return Err(RtpError::MalformedExtension(format!(
                        "frame diff {fdiff} out of range"
                    )));
                }
                let size = if fdiff <= 1 << 4 {
                    1
                } else if fdiff <= 1 << 8 {
                    2
                } else {
                    3
                };
                writer.write_bits(size, 2);
                writer.write_bits(u64::from(fdiff - 1), 4 * size as u32);
            }
            writer.write_bits(0, 2);
        }
        if custom_chains {
            for &chain_diff in &self.frame_dependencies.chain_diffs {
                writer.write_bits(u64::from(chain_diff), 8);
            }
        }
        Ok(writer.into_bytes())
    }
}

fn read_structure(reader: &mut BitReader<'_>) -> Result<FrameDependencyStructure> {
    let mut structure = FrameDependencyStructure {
        structure_id: reader.read_bits(6)? as u8,
        num_decode_targets: reader.read_bits(5)? + 1,
        ..Default::default()
    };

    let mut spatial_id = 0u8;
    let mut temporal_id = 0u8;
    loop {
        if structure.templates.len() == MAX_TEMPLATES {
            return Err(RtpError::MalformedExtension("too many templates".to_string()));
        }
        structure
            .templates
            .push(FrameDependencyTemplate::new(spatial_id, temporal_id));
        match reader.read_bits(2)? {
            1 => {
                temporal_id += 1;
                if temporal_id >= MAX_TEMPORAL_IDS {
                    return Err(RtpError::MalformedExtension("temporal id overflow".to_string()));
                }
            }
            2 => {
                temporal_id = 0;
                spatial_id += 1;
                if spatial_id >= MAX_SPATIAL_IDS {
                    return Err(RtpError::MalformedExtension("spatial id overflow".to_string()));
                }
            }
            3 => break,
            _ => {}
        }
    }

    for template in structure.templates.iter_mut() {
        for _ in 0..structure.num_decode_targets {
            template
                .decode_target_indications
                .push(DecodeTargetIndication::from_bits(reader.read_bits(2)?));
        }
    }
    for template in structure.templates.iter_mut() {
        while reader.read_bit()? {
            template.frame_diffs.push(reader.read_bits(4)? + 1);
        }
    }

    structure.num_chains = reader.read_non_symmetric(structure.num_decode_targets + 1)?;
    if structure.num_chains > 0 {
        for _ in 0..structure.num_decode_targets {
            let protected_by = reader.read_non_symmetric(structure.num_chains)?;
            structure.decode_target_protected_by_chain.push(protected_by);
        }
        for template in structure.templates.iter_mut() {
            for _ in 0..structure.num_chains {
                template.chain_diffs.push(reader.read_bits(4)?);
            }
        }
    }

    if reader.read_bit()? {
        let spatial_layers = structure
            .templates
            .last()
            .map(|t| t.spatial_id + 1)
            .unwrap_or(1);
        for _ in 0..spatial_layers {
            let width = u32::from(reader.read_u16()?) + 1;
            let height = u32::from(reader.read_u16()?) + 1;
            structure.resolutions.push(RenderResolution { width, height });
        }
    }
    Ok(structure)
}

fn next_layer_idc(
    previous: &FrameDependencyTemplate,
    next: &FrameDependencyTemplate,
) -> Option<NextLayerIdc> {
    if next.spatial_id == previous.spatial_id && next.temporal_id == previous.temporal_id {
        Some(NextLayerIdc::SameLayer)
    } else if next.spatial_id == previous.spatial_id
        && next.temporal_id == previous.temporal_id + 1
    {
        Some(NextLayerIdc::NextTemporal)
    } else if next.spatial_id == previous.spatial_id + 1 && next.temporal_id == 0 {
        Some(NextLayerIdc::NextSpatial)
    } else {
        None
    }
}

fn validate_structure(structure: &FrameDependencyStructure) -> Result<()> {
    let invalid = |reason: &str| Err(RtpError::MalformedExtension(reason.to_string()));
    if structure.num_decode_targets == 0 || structure.num_decode_targets > MAX_DECODE_TARGETS {
        return invalid("decode target count out of range");
    }
    if structure.structure_id as usize >= MAX_TEMPLATES {
        return invalid("structure id out of range");
    }
    let Some(first) = structure.templates.first() else {
        return invalid("structure without templates");
    };
    if structure.templates.len() >= MAX_TEMPLATES || first.spatial_id != 0 || first.temporal_id != 0
    {
        return invalid("bad template list");
    }
    for template in &structure.templates {
        if template.decode_target_indications.len() != structure.num_decode_targets as usize
            || template.chain_diffs.len() != structure.num_chains as usize
            || template.frame_diffs.iter().any(|&d| d == 0 || d > 16)
        {
            return invalid("template does not match structure");
        }
    }
    if structure
        .templates
        .windows(2)
        .any(|pair| next_layer_idc(&pair[0], &pair[1]).is_none())
    {
        return invalid("templates are not ordered by layer");
    }
    if structure.num_chains > 0
        && structure.decode_target_protected_by_chain.len() != structure.num_decode_targets as usize
    {
        return invalid("chain protection list does not match decode targets");
    }
    let spatial_layers = structure.templates.iter().map(|t| t.spatial_id).max().unwrap_or(0) + 1;
    if !structure.resolutions.is_empty() && structure.resolutions.len() != spatial_layers as usize {
        return invalid("one resolution per spatial layer required");
    }
    Ok(())
}

/// Picks the template of the frame's layer that needs the fewest custom fields.
fn best_template<'s>(
    frame: &FrameDependencyTemplate,
    structure: &'s FrameDependencyStructure,
) -> Option<(usize, &'s FrameDependencyTemplate)> {
    structure
        .templates
        .iter()
        .enumerate()
        .filter(|(_, t)| t.spatial_id == frame.spatial_id && t.temporal_id == frame.temporal_id)
        .min_by_key(|(_, t)| {
            usize::from(t.frame_diffs != frame.frame_diffs)
                + usize::from(t.decode_target_indications != frame.decode_target_indications)
                + usize::from(t.chain_diffs != frame.chain_diffs)
        })
}

fn write_structure(writer: &mut BitWriter, structure: &FrameDependencyStructure) {
    writer.write_bits(u64::from(structure.structure_id), 6);
    writer.write_bits(u64::from(structure.num_decode_targets - 1), 5);
    for pair in structure.templates.windows(2) {
        let idc = next_layer_idc(&pair[0], &pair[1]).unwrap_or(NextLayerIdc::SameLayer);
        writer.write_bits(idc as u64, 2);
    }
    writer.write_bits(NextLayerIdc::NoMoreTemplates as u64, 2);
    for template in &structure.templates {
        for dti in &template.decode_target_indications {
            writer.write_bits(*dti as u64, 2);
        }
    }
    for template in &structure.templates {
        for &fdiff in &template.frame_diffs {
            writer.write_bits(u64::from((1 << 4) | (fdiff - 1)), 5);
        }
        writer.write_bit(false);
    }
    writer.write_non_symmetric(structure.num_chains, structure.num_decode_targets + 1);
    if structure.num_chains > 0 {
        for &protected_by in &structure.decode_target_protected_by_chain {
            writer.write_non_symmetric(protected_by, structure.num_chains);
        }
        for template in &structure.templates {
            for &chain_diff in &template.chain_diffs {
                writer.write_bits(u64::from(chain_diff), 4);
            }
        }
    }
    writer.write_bit(!structure.resolutions.is_empty());
    for resolution in &structure.resolutions {
        writer.write_bits(u64::from(resolution.width - 1), 16);
        writer.write_bits(u64::from(resolution.height - 1), 16);
    }
}
