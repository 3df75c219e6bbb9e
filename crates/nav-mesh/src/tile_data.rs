//! Binary layout of map and tile files
//!
//! Tiles are stored little-endian: an `MmapTileHeader` frame followed by a
//! tile blob (mesh header plus packed vertex, polygon, link, detail,
//! BV-tree and off-mesh connection sections, each aligned to 4 bytes).
//! The map header file holds a single serialized [`NavMeshParams`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use super::nav_mesh::{
    BvNode, NavMeshParams, OffMeshConnection, Poly, PolyDetail, TileData, TileHeader,
};
use super::{PolyType, Status, StatusResult, NAV_MESH_MAGIC, NAV_MESH_VERSION, VERTS_PER_POLYGON};

/// Magic number of tile frame headers ('MMAP')
pub const MMAP_MAGIC: u32 = 0x4d4d_4150;

/// Version of the tile frame layout
pub const MMAP_VERSION: u32 = 8;

/// Frame prefixed to every tile file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapTileHeader {
    pub mmap_magic: u32,
    pub dt_version: u32,
    pub mmap_version: u32,
    /// Byte length of the tile blob that follows
    pub size: u32,
    pub uses_liquids: u8,
}

impl MmapTileHeader {
    pub fn new(size: u32, uses_liquids: bool) -> Self {
        Self {
            mmap_magic: MMAP_MAGIC,
            dt_version: NAV_MESH_VERSION,
            mmap_version: MMAP_VERSION,
            size,
            uses_liquids: uses_liquids as u8,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mmap_magic = reader.read_u32::<LittleEndian>()?;
        let dt_version = reader.read_u32::<LittleEndian>()?;
        let mmap_version = reader.read_u32::<LittleEndian>()?;
        let size = reader.read_u32::<LittleEndian>()?;
        let uses_liquids = reader.read_u8()?;
        let mut padding = [0u8; 3];
        reader.read_exact(&mut padding)?;
        Ok(Self {
            mmap_magic,
            dt_version,
            mmap_version,
            size,
            uses_liquids,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.mmap_magic)?;
        writer.write_u32::<LittleEndian>(self.dt_version)?;
        writer.write_u32::<LittleEndian>(self.mmap_version)?;
        writer.write_u32::<LittleEndian>(self.size)?;
        writer.write_u8(self.uses_liquids)?;
        writer.write_all(&[0u8; 3])?;
        Ok(())
    }
}

impl NavMeshParams {
    /// Reads mesh parameters from a map header file
    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            origin: [
                reader.read_f32::<LittleEndian>()?,
                reader.read_f32::<LittleEndian>()?,
                reader.read_f32::<LittleEndian>()?,
            ],
            tile_width: reader.read_f32::<LittleEndian>()?,
            tile_height: reader.read_f32::<LittleEndian>()?,
            max_tiles: reader.read_i32::<LittleEndian>()?,
            max_polys: reader.read_i32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_f32::<LittleEndian>(self.origin[0])?;
        writer.write_f32::<LittleEndian>(self.origin[1])?;
        writer.write_f32::<LittleEndian>(self.origin[2])?;
        writer.write_f32::<LittleEndian>(self.tile_width)?;
        writer.write_f32::<LittleEndian>(self.tile_height)?;
        writer.write_i32::<LittleEndian>(self.max_tiles)?;
        writer.write_i32::<LittleEndian>(self.max_polys)?;
        Ok(())
    }
}

fn read_header<R: Read>(reader: &mut R) -> StatusResult<TileHeader> {
    let io = |_| Status::FAILURE | Status::INVALID_PARAM;

    let magic = reader.read_u32::<LittleEndian>().map_err(io)?;
    if magic != NAV_MESH_MAGIC {
        return Err(Status::FAILURE | Status::WRONG_MAGIC);
    }
    let version = reader.read_u32::<LittleEndian>().map_err(io)?;
    if version != NAV_MESH_VERSION {
        return Err(Status::FAILURE | Status::WRONG_VERSION);
    }

    Ok(TileHeader {
        x: reader.read_i32::<LittleEndian>().map_err(io)?,
        y: reader.read_i32::<LittleEndian>().map_err(io)?,
        layer: reader.read_i32::<LittleEndian>().map_err(io)?,
        user_id: reader.read_u32::<LittleEndian>().map_err(io)?,
        poly_count: reader.read_i32::<LittleEndian>().map_err(io)?,
        vert_count: reader.read_i32::<LittleEndian>().map_err(io)?,
        max_link_count: reader.read_i32::<LittleEndian>().map_err(io)?,
        detail_mesh_count: reader.read_i32::<LittleEndian>().map_err(io)?,
        detail_vert_count: reader.read_i32::<LittleEndian>().map_err(io)?,
        detail_tri_count: reader.read_i32::<LittleEndian>().map_err(io)?,
        bv_node_count: reader.read_i32::<LittleEndian>().map_err(io)?,
        off_mesh_con_count: reader.read_i32::<LittleEndian>().map_err(io)?,
        off_mesh_base: reader.read_i32::<LittleEndian>().map_err(io)?,
        walkable_height: reader.read_f32::<LittleEndian>().map_err(io)?,
        walkable_radius: reader.read_f32::<LittleEndian>().map_err(io)?,
        walkable_climb: reader.read_f32::<LittleEndian>().map_err(io)?,
        bmin: [
            reader.read_f32::<LittleEndian>().map_err(io)?,
            reader.read_f32::<LittleEndian>().map_err(io)?,
            reader.read_f32::<LittleEndian>().map_err(io)?,
        ],
        bmax: [
            reader.read_f32::<LittleEndian>().map_err(io)?,
            reader.read_f32::<LittleEndian>().map_err(io)?,
            reader.read_f32::<LittleEndian>().map_err(io)?,
        ],
        bv_quant_factor: reader.read_f32::<LittleEndian>().map_err(io)?,
    })
}

fn write_header<W: Write>(header: &TileHeader, writer: &mut W) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(NAV_MESH_MAGIC)?;
    writer.write_u32::<LittleEndian>(NAV_MESH_VERSION)?;
    writer.write_i32::<LittleEndian>(header.x)?;
    writer.write_i32::<LittleEndian>(header.y)?;
    writer.write_i32::<LittleEndian>(header.layer)?;
    writer.write_u32::<LittleEndian>(header.user_id)?;
    writer.write_i32::<LittleEndian>(header.poly_count)?;
    writer.write_i32::<LittleEndian>(header.vert_count)?;
    writer.write_i32::<LittleEndian>(header.max_link_count)?;
    writer.write_i32::<LittleEndian>(header.detail_mesh_count)?;
    writer.write_i32::<LittleEndian>(header.detail_vert_count)?;
    writer.write_i32::<LittleEndian>(header.detail_tri_count)?;
    writer.write_i32::<LittleEndian>(header.bv_node_count)?;
    writer.write_i32::<LittleEndian>(header.off_mesh_con_count)?;
    writer.write_i32::<LittleEndian>(header.off_mesh_base)?;
    writer.write_f32::<LittleEndian>(header.walkable_height)?;
    writer.write_f32::<LittleEndian>(header.walkable_radius)?;
    writer.write_f32::<LittleEndian>(header.walkable_climb)?;
    for v in header.bmin {
        writer.write_f32::<LittleEndian>(v)?;
    }
    for v in header.bmax {
        writer.write_f32::<LittleEndian>(v)?;
    }
    writer.write_f32::<LittleEndian>(header.bv_quant_factor)?;
    Ok(())
}

/// Parses a tile blob into its in-memory representation
///
/// The stored link section only reserves space; links are rebuilt when
/// the tile is added to a mesh, so its contents are skipped.
pub fn read_tile_data(data: &[u8]) -> StatusResult<TileData> {
    let io = |_| Status::FAILURE | Status::INVALID_PARAM;
    let mut cur = Cursor::new(data);

    let header = read_header(&mut cur)?;
    if header.poly_count < 0
        || header.vert_count < 0
        || header.max_link_count < 0
        || header.detail_mesh_count < 0
        || header.detail_vert_count < 0
        || header.detail_tri_count < 0
        || header.bv_node_count < 0
        || header.off_mesh_con_count < 0
    {
        return Err(Status::FAILURE | Status::INVALID_PARAM);
    }

    let mut verts = vec![0.0f32; header.vert_count as usize * 3];
    for v in verts.iter_mut() {
        *v = cur.read_f32::<LittleEndian>().map_err(io)?;
    }

    let mut polys = Vec::with_capacity(header.poly_count as usize);
    for _ in 0..header.poly_count {
        // first_link is runtime state; the stored value is ignored.
        let _ = cur.read_u32::<LittleEndian>().map_err(io)?;
        let mut poly = Poly::new(0, PolyType::Ground, 0);
        for v in poly.verts.iter_mut() {
            *v = cur.read_u16::<LittleEndian>().map_err(io)?;
        }
        for n in poly.neis.iter_mut() {
            *n = cur.read_u16::<LittleEndian>().map_err(io)?;
        }
        poly.flags = cur.read_u16::<LittleEndian>().map_err(io)?;
        poly.vert_count = cur.read_u8().map_err(io)?;
        let area_and_type = cur.read_u8().map_err(io)?;
        poly.area = area_and_type & 0x3f;
        poly.poly_type = PolyType::from_u8(area_and_type >> 6);
        polys.push(poly);
    }

    // Reserved link section.
    cur.seek(SeekFrom::Current(header.max_link_count as i64 * 12))
        .map_err(io)?;

    let mut detail_meshes = Vec::with_capacity(header.detail_mesh_count as usize);
    for _ in 0..header.detail_mesh_count {
        let mut dm = PolyDetail::default();
        dm.vert_base = cur.read_u32::<LittleEndian>().map_err(io)?;
        dm.tri_base = cur.read_u32::<LittleEndian>().map_err(io)?;
        dm.vert_count = cur.read_u8().map_err(io)?;
        dm.tri_count = cur.read_u8().map_err(io)?;
        let mut pad = [0u8; 2];
        cur.read_exact(&mut pad).map_err(io)?;
        detail_meshes.push(dm);
    }

    let mut detail_verts = vec![0.0f32; header.detail_vert_count as usize * 3];
    for v in detail_verts.iter_mut() {
        *v = cur.read_f32::<LittleEndian>().map_err(io)?;
    }

    let tri_bytes = header.detail_tri_count as usize * 4;
    let mut detail_tris = vec![0u8; tri_bytes];
    cur.read_exact(&mut detail_tris).map_err(io)?;

    let mut bv_tree = Vec::with_capacity(header.bv_node_count as usize);
    for _ in 0..header.bv_node_count {
        let mut node = BvNode::default();
        for v in node.bmin.iter_mut() {
            *v = cur.read_u16::<LittleEndian>().map_err(io)?;
        }
        for v in node.bmax.iter_mut() {
            *v = cur.read_u16::<LittleEndian>().map_err(io)?;
        }
        node.i = cur.read_i32::<LittleEndian>().map_err(io)?;
        bv_tree.push(node);
    }

    let mut off_mesh_cons = Vec::with_capacity(header.off_mesh_con_count as usize);
    for _ in 0..header.off_mesh_con_count {
        let mut pos = [0.0f32; 6];
        for v in pos.iter_mut() {
            *v = cur.read_f32::<LittleEndian>().map_err(io)?;
        }
        let rad = cur.read_f32::<LittleEndian>().map_err(io)?;
        let poly = cur.read_u16::<LittleEndian>().map_err(io)?;
        let flags = cur.read_u8().map_err(io)?;
        let side = cur.read_u8().map_err(io)?;
        let user_id = cur.read_u32::<LittleEndian>().map_err(io)?;
        off_mesh_cons.push(OffMeshConnection {
            pos,
            rad,
            poly,
            flags,
            side,
            user_id,
        });
    }

    Ok(TileData {
        header,
        verts,
        polys,
        detail_meshes,
        detail_verts,
        detail_tris,
        bv_tree,
        off_mesh_cons,
    })
}

/// Serializes a tile into the binary blob layout
pub fn write_tile_data(data: &TileData) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&data.header, &mut out)?;

    for v in &data.verts {
        out.write_f32::<LittleEndian>(*v)?;
    }

    for poly in &data.polys {
        out.write_u32::<LittleEndian>(super::NULL_LINK)?;
        for v in poly.verts {
            out.write_u16::<LittleEndian>(v)?;
        }
        for n in poly.neis {
            out.write_u16::<LittleEndian>(n)?;
        }
        out.write_u16::<LittleEndian>(poly.flags)?;
        out.write_u8(poly.vert_count)?;
        out.write_u8((poly.poly_type.to_u8() << 6) | (poly.area & 0x3f))?;
    }

    // Reserved link section.
    out.extend(std::iter::repeat(0u8).take(data.header.max_link_count as usize * 12));

    for dm in &data.detail_meshes {
        out.write_u32::<LittleEndian>(dm.vert_base)?;
        out.write_u32::<LittleEndian>(dm.tri_base)?;
        out.write_u8(dm.vert_count)?;
        out.write_u8(dm.tri_count)?;
        out.write_all(&[0u8; 2])?;
    }

    for v in &data.detail_verts {
        out.write_f32::<LittleEndian>(*v)?;
    }

    out.write_all(&data.detail_tris)?;

    for node in &data.bv_tree {
        for v in node.bmin {
            out.write_u16::<LittleEndian>(v)?;
        }
        for v in node.bmax {
            out.write_u16::<LittleEndian>(v)?;
        }
        out.write_i32::<LittleEndian>(node.i)?;
    }

    for con in &data.off_mesh_cons {
        for v in con.pos {
            out.write_f32::<LittleEndian>(v)?;
        }
        out.write_f32::<LittleEndian>(con.rad)?;
        out.write_u16::<LittleEndian>(con.poly)?;
        out.write_u8(con.flags)?;
        out.write_u8(con.side)?;
        out.write_u32::<LittleEndian>(con.user_id)?;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tile() -> TileData {
        let mut poly = Poly::new(3, PolyType::Ground, 0x0001);
        poly.vert_count = 4;
        poly.verts = [0, 1, 2, 3, 0, 0];
        poly.neis = [0, 0, 0, 0, 0, 0];

        TileData {
            header: TileHeader {
                x: 2,
                y: 5,
                layer: 0,
                user_id: 77,
                poly_count: 1,
                vert_count: 4,
                max_link_count: 8,
                detail_mesh_count: 1,
                detail_vert_count: 0,
                detail_tri_count: 2,
                bv_node_count: 0,
                off_mesh_con_count: 1,
                off_mesh_base: 1,
                walkable_height: 2.0,
                walkable_radius: 0.6,
                walkable_climb: 0.9,
                bmin: [0.0, -1.0, 0.0],
                bmax: [10.0, 1.0, 10.0],
                bv_quant_factor: 0.0,
            },
            verts: vec![
                0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                1.0, 0.0, 1.0, //
                0.0, 0.0, 1.0,
            ],
            polys: vec![poly],
            detail_meshes: vec![PolyDetail {
                vert_base: 0,
                tri_base: 0,
                vert_count: 0,
                tri_count: 2,
            }],
            detail_verts: vec![],
            detail_tris: vec![0, 1, 2, 0, 0, 2, 3, 0],
            bv_tree: vec![],
            off_mesh_cons: vec![OffMeshConnection {
                pos: [0.5, 0.0, 0.5, 8.0, 0.0, 8.0],
                rad: 0.5,
                poly: 1,
                flags: 1,
                side: 0xff,
                user_id: 9,
            }],
        }
    }

    #[test]
    fn test_tile_blob_round_trip() {
        let tile = sample_tile();
        let blob = write_tile_data(&tile).unwrap();
        let parsed = read_tile_data(&blob).unwrap();

        assert_eq!(parsed.header.x, 2);
        assert_eq!(parsed.header.y, 5);
        assert_eq!(parsed.header.poly_count, 1);
        assert_eq!(parsed.verts, tile.verts);
        assert_eq!(parsed.polys[0].vert_count, 4);
        assert_eq!(parsed.polys[0].area, 3);
        assert_eq!(parsed.polys[0].flags, 0x0001);
        assert_eq!(parsed.detail_tris, tile.detail_tris);
        assert_eq!(parsed.off_mesh_cons.len(), 1);
        assert_eq!(parsed.off_mesh_cons[0].poly, 1);
        assert_eq!(parsed.off_mesh_cons[0].user_id, 9);
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let tile = sample_tile();
        let mut blob = write_tile_data(&tile).unwrap();

        let mut bad_magic = blob.clone();
        bad_magic[0] ^= 0xff;
        let err = read_tile_data(&bad_magic).unwrap_err();
        assert!(err.has_detail(Status::WRONG_MAGIC));

        blob[4] ^= 0xff;
        let err = read_tile_data(&blob).unwrap_err();
        assert!(err.has_detail(Status::WRONG_VERSION));
    }

    #[test]
    fn test_frame_header_round_trip() {
        let header = MmapTileHeader::new(1234, true);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 20);

        let parsed = MmapTileHeader::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.mmap_magic, MMAP_MAGIC);
        assert_eq!(parsed.size, 1234);
        assert_eq!(parsed.uses_liquids, 1);
    }
}
