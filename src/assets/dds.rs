// Minimal DDS container reader
//
// Produces the CPU-side image the texture upload path consumes: extent,
// mip count, per-mip byte sizes, Vulkan format and the raw mip chain.
// Only the first surface is read; cube maps and arrays are ignored.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::path::Path;

const MAGIC: u32 = 0x2053_4444; // "DDS "
const HEADER_SIZE: usize = 124;
const DX10_HEADER_SIZE: usize = 20;

const DDSD_MIPMAPCOUNT: u32 = 0x2_0000;
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Decoded DDS mip chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdsImage {
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub format: vk::Format,
    pub mip_sizes: Vec<u64>,
    pub data: Vec<u8>,
}

/// Placement of one mip level inside `DdsImage::data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipRegion {
    pub level: u32,
    pub width: u32,
    pub height: u32,
    pub offset: u64,
    pub size: u64,
}

impl DdsImage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read texture {:?}", path))?;
        Self::parse(&bytes).with_context(|| format!("Failed to decode texture {:?}", path))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 + HEADER_SIZE || read_u32(bytes, 0) != MAGIC {
            bail!("Not a DDS file");
        }
        if read_u32(bytes, 4) as usize != HEADER_SIZE {
            bail!("Unexpected DDS header size {}", read_u32(bytes, 4));
        }

        let flags = read_u32(bytes, 8);
        let height = read_u32(bytes, 12);
        let width = read_u32(bytes, 16);
        let declared_mips = read_u32(bytes, 28);
        let pf_flags = read_u32(bytes, 80);
        let pf_fourcc = read_u32(bytes, 84);
        let pf_bit_count = read_u32(bytes, 88);
        let pf_r_mask = read_u32(bytes, 92);

        if width == 0 || height == 0 {
            bail!("DDS image has zero extent");
        }

        let mut data_offset = 4 + HEADER_SIZE;
        let format = if pf_flags & DDPF_FOURCC != 0 {
            if pf_fourcc == fourcc(b"DX10") {
                if bytes.len() < data_offset + DX10_HEADER_SIZE {
                    bail!("Truncated DX10 header");
                }
                let dxgi = read_u32(bytes, data_offset);
                data_offset += DX10_HEADER_SIZE;
                format_from_dxgi(dxgi)
                    .with_context(|| format!("Unsupported DXGI format {}", dxgi))?
            } else {
                format_from_fourcc(pf_fourcc).with_context(|| {
                    format!(
                        "Unsupported FourCC {:?}",
                        String::from_utf8_lossy(&pf_fourcc.to_le_bytes())
                    )
                })?
            }
        } else if pf_flags & DDPF_RGB != 0 && pf_bit_count == 32 {
            if pf_r_mask == 0x00ff_0000 {
                vk::Format::B8G8R8A8_UNORM
            } else {
                vk::Format::R8G8B8A8_UNORM
            }
        } else {
            bail!("Unsupported DDS pixel format (flags {:#x})", pf_flags);
        };

        let mip_count = if flags & DDSD_MIPMAPCOUNT != 0 {
            declared_mips.max(1)
        } else {
            1
        };
        let full_chain = max_mip_count(width, height);
        if mip_count > full_chain {
            bail!(
                "DDS declares {} mips but a {}x{} image has at most {}",
                mip_count,
                width,
                height,
                full_chain
            );
        }

        let mip_sizes: Vec<u64> = (0..mip_count)
            .map(|level| mip_byte_size(format, mip_extent(width, level), mip_extent(height, level)))
            .collect();
        let total: u64 = mip_sizes.iter().sum();

        let payload = &bytes[data_offset..];
        if (payload.len() as u64) < total {
            bail!(
                "DDS payload has {} bytes, {} mips need {}",
                payload.len(),
                mip_count,
                total
            );
        }

        Ok(Self {
            width,
            height,
            mip_count,
            format,
            mip_sizes,
            data: payload[..total as usize].to_vec(),
        })
    }

    /// 1x1 RGBA8 image, used when no texture is configured.
    pub fn solid_rgba(color: [u8; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            mip_count: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            mip_sizes: vec![4],
            data: color.to_vec(),
        }
    }

    /// Extent and byte offset of each mip; offsets accumulate prior mip sizes.
    pub fn mip_regions(&self) -> Vec<MipRegion> {
        let mut offset = 0;
        self.mip_sizes
            .iter()
            .enumerate()
            .map(|(level, &size)| {
                let level = level as u32;
                let region = MipRegion {
                    level,
                    width: mip_extent(self.width, level),
                    height: mip_extent(self.height, level),
                    offset,
                    size,
                };
                offset += size;
                region
            })
            .collect()
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Length of the full chain down to 1x1: floor(log2(max(w, h))) + 1.
fn max_mip_count(width: u32, height: u32) -> u32 {
    u32::BITS - width.max(height).leading_zeros()
}

fn mip_extent(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

fn format_from_fourcc(code: u32) -> Option<vk::Format> {
    match code {
        c if c == fourcc(b"DXT1") => Some(vk::Format::BC1_RGBA_UNORM_BLOCK),
        c if c == fourcc(b"DXT3") => Some(vk::Format::BC2_UNORM_BLOCK),
        c if c == fourcc(b"DXT5") => Some(vk::Format::BC3_UNORM_BLOCK),
        c if c == fourcc(b"ATI1") || c == fourcc(b"BC4U") => Some(vk::Format::BC4_UNORM_BLOCK),
        c if c == fourcc(b"ATI2") || c == fourcc(b"BC5U") => Some(vk::Format::BC5_UNORM_BLOCK),
        _ => None,
    }
}

fn format_from_dxgi(dxgi: u32) -> Option<vk::Format> {
    Some(match dxgi {
        28 => vk::Format::R8G8B8A8_UNORM,
        29 => vk::Format::R8G8B8A8_SRGB,
        71 => vk::Format::BC1_RGBA_UNORM_BLOCK,
        72 => vk::Format::BC1_RGBA_SRGB_BLOCK,
        74 => vk::Format::BC2_UNORM_BLOCK,
        75 => vk::Format::BC2_SRGB_BLOCK,
        77 => vk::Format::BC3_UNORM_BLOCK,
        78 => vk::Format::BC3_SRGB_BLOCK,
        80 => vk::Format::BC4_UNORM_BLOCK,
        83 => vk::Format::BC5_UNORM_BLOCK,
        87 => vk::Format::B8G8R8A8_UNORM,
        91 => vk::Format::B8G8R8A8_SRGB,
        95 => vk::Format::BC6H_UFLOAT_BLOCK,
        98 => vk::Format::BC7_UNORM_BLOCK,
        99 => vk::Format::BC7_SRGB_BLOCK,
        _ => return None,
    })
}

/// Bytes per 4x4 block for block-compressed formats.
fn block_bytes(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::BC1_RGBA_UNORM_BLOCK
        | vk::Format::BC1_RGBA_SRGB_BLOCK
        | vk::Format::BC4_UNORM_BLOCK => Some(8),
        vk::Format::BC2_UNORM_BLOCK
        | vk::Format::BC2_SRGB_BLOCK
        | vk::Format::BC3_UNORM_BLOCK
        | vk::Format::BC3_SRGB_BLOCK
        | vk::Format::BC5_UNORM_BLOCK
        | vk::Format::BC6H_UFLOAT_BLOCK
        | vk::Format::BC7_UNORM_BLOCK
        | vk::Format::BC7_SRGB_BLOCK => Some(16),
        _ => None,
    }
}

pub fn mip_byte_size(format: vk::Format, width: u32, height: u32) -> u64 {
    match block_bytes(format) {
        Some(block) => {
            let blocks_x = width.div_ceil(4).max(1) as u64;
            let blocks_y = height.div_ceil(4).max(1) as u64;
            blocks_x * blocks_y * block
        }
        None => width as u64 * height as u64 * 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(width: u32, height: u32, mips: u32, pf_flags: u32, code: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; 4 + HEADER_SIZE];
        let mut put = |offset: usize, value: u32| {
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes())
        };
        put(0, MAGIC);
        put(4, HEADER_SIZE as u32);
        put(8, 0x1 | 0x2 | 0x4 | 0x1000 | DDSD_MIPMAPCOUNT);
        put(12, height);
        put(16, width);
        put(28, mips);
        put(76, 32);
        put(80, pf_flags);
        put(84, code);
        put(88, 32);
        bytes
    }

    #[test]
    fn dxt1_mip_chain_offsets_accumulate() {
        let mut bytes = header(64, 64, 7, DDPF_FOURCC, fourcc(b"DXT1"));
        let sizes = [2048u64, 512, 128, 32, 8, 8, 8];
        let total: u64 = sizes.iter().sum();
        bytes.extend((0..total).map(|i| i as u8));

        let image = DdsImage::parse(&bytes).unwrap();
        assert_eq!(image.format, vk::Format::BC1_RGBA_UNORM_BLOCK);
        assert_eq!(image.mip_count, 7);
        assert_eq!(image.mip_sizes, sizes);
        assert_eq!(image.data.len() as u64, total);

        let regions = image.mip_regions();
        assert_eq!(regions[0].offset, 0);
        assert_eq!(regions[1].offset, 2048);
        assert_eq!(regions[2].offset, 2560);
        assert_eq!(regions[6].width, 1);
        assert_eq!(regions[6].height, 1);
        assert_eq!(regions[6].offset, total - 8);
    }

    #[test]
    fn dx10_header_selects_dxgi_format() {
        let mut bytes = header(8, 4, 1, DDPF_FOURCC, fourcc(b"DX10"));
        let mut dx10 = vec![0u8; DX10_HEADER_SIZE];
        dx10[..4].copy_from_slice(&98u32.to_le_bytes());
        bytes.extend(dx10);
        bytes.extend(vec![0xAB; 32]);

        let image = DdsImage::parse(&bytes).unwrap();
        assert_eq!(image.format, vk::Format::BC7_UNORM_BLOCK);
        assert_eq!(image.mip_sizes, vec![32]);
    }

    #[test]
    fn uncompressed_bgra() {
        let mut bytes = header(2, 2, 1, DDPF_RGB, 0);
        bytes[92..96].copy_from_slice(&0x00ff_0000u32.to_le_bytes());
        bytes.extend(vec![0u8; 16]);

        let image = DdsImage::parse(&bytes).unwrap();
        assert_eq!(image.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(image.mip_sizes, vec![16]);
    }

    #[test]
    fn full_chain_length_follows_largest_side() {
        assert_eq!(max_mip_count(1, 1), 1);
        assert_eq!(max_mip_count(4, 4), 3);
        assert_eq!(max_mip_count(64, 8), 7);
        assert_eq!(max_mip_count(5, 3), 3);
        assert_eq!(max_mip_count(u32::MAX, 1), 32);
    }

    #[test]
    fn mip_count_beyond_full_chain_is_rejected() {
        let mut bytes = header(4, 4, 8, DDPF_FOURCC, fourcc(b"DXT1"));
        bytes.extend(vec![0u8; 64]);
        let err = DdsImage::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("at most 3"), "{}", err);

        let mut bytes = header(1, 1, 40, DDPF_RGB, 0);
        bytes.extend(vec![0u8; 4 * 40]);
        assert!(DdsImage::parse(&bytes).is_err());
    }

    #[test]
    fn full_chain_is_accepted() {
        let mut bytes = header(4, 4, 3, DDPF_RGB, 0);
        bytes.extend(vec![0u8; 64 + 16 + 4]);
        let image = DdsImage::parse(&bytes).unwrap();
        assert_eq!(image.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(image.mip_sizes, vec![64, 16, 4]);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = header(16, 16, 1, DDPF_FOURCC, fourcc(b"DXT5"));
        bytes.extend(vec![0u8; 100]);
        assert!(DdsImage::parse(&bytes).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(DdsImage::parse(b"PNG not a dds").is_err());
    }

    #[test]
    fn solid_color_is_single_texel() {
        let image = DdsImage::solid_rgba([255, 0, 0, 255]);
        assert_eq!(image.mip_regions().len(), 1);
        assert_eq!(image.data, vec![255, 0, 0, 255]);
    }
}
