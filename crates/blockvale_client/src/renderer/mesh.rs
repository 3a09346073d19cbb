use bitvec::prelude::*;
use bytemuck::{Pod, Zeroable};
use blockvale_shared::{
    block::{BlockFace, BlockId, BlockRegistry},
    chunk::ChunkData,
    coords::{column_origin, ColumnPos},
};

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ChunkVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub layer: u32,
}
const _: [(); 36] = [(); std::mem::size_of::<ChunkVertex>()];

impl ChunkVertex {
    const ATTRIBUTES: [wgpu::VertexAttribute; 4] = wgpu::vertex_attr_array![
        0 => Float32x3,
        1 => Float32x3,
        2 => Float32x2,
        3 => Uint32
    ];

    pub fn desc<'a>() -> wgpu::VertexBufferLayout<'a> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<ChunkVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMesh {
    pub vertices: Vec<ChunkVertex>,
    pub indices: Vec<u32>,
}

/// One unit block face covered by a mesh: the solid block, the face direction and its texture layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FaceCell {
    pub block: [i32; 3],
    pub direction: u8,
    pub layer: u32,
}

impl ChunkMesh {
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Expands every quad into the unit faces it covers, sorted.
    pub fn face_cells(&self) -> Vec<FaceCell> {
        let mut cells = Vec::new();

        for quad in self.vertices.chunks_exact(4) {
            let normal = quad[0].normal;
            let Some(direction) = FACE_SPECS.iter().position(|spec| spec.normal == normal) else {
                continue;
            };
            let face = FACE_SPECS[direction];

            let mut min = [f32::MAX; 3];
            let mut max = [f32::MIN; 3];
            for vertex in quad {
                for axis in 0..3 {
                    min[axis] = min[axis].min(vertex.position[axis]);
                    max[axis] = max[axis].max(vertex.position[axis]);
                }
            }

            let plane = min[face.axis].round() as i32;
            let block_plane = if face.sign > 0 { plane - 1 } else { plane };
            let (u0, u1) = (min[face.u_axis].round() as i32, max[face.u_axis].round() as i32);
            let (v0, v1) = (min[face.v_axis].round() as i32, max[face.v_axis].round() as i32);

            for u in u0..u1 {
                for v in v0..v1 {
                    let mut block = [0i32; 3];
                    block[face.axis] = block_plane;
                    block[face.u_axis] = u;
                    block[face.v_axis] = v;
                    cells.push(FaceCell {
                        block,
                        direction: direction as u8,
                        layer: quad[0].layer,
                    });
                }
            }
        }

        cells.sort_unstable();
        cells
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MeshingMode {
    Naive,
    #[default]
    Greedy,
}

/// Horizontal neighbours of the column being meshed. `None` reads as non-solid.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkNeighbors<'a> {
    pub pos_x: Option<&'a ChunkData>,
    pub neg_x: Option<&'a ChunkData>,
    pub pos_z: Option<&'a ChunkData>,
    pub neg_z: Option<&'a ChunkData>,
}

#[derive(Copy, Clone)]
struct FaceSpec {
    axis: usize,
    sign: i32,
    u_axis: usize,
    v_axis: usize,
    normal: [f32; 3],
}

impl FaceSpec {
    fn block_face(&self) -> BlockFace {
        match (self.axis, self.sign) {
            (1, 1) => BlockFace::Top,
            (1, _) => BlockFace::Bottom,
            _ => BlockFace::Side,
        }
    }
}

const FACE_SPECS: [FaceSpec; 6] = [
    // +X
    FaceSpec {
        axis: 0,
        sign: 1,
        u_axis: 1,
        v_axis: 2,
        normal: [1.0, 0.0, 0.0],
    },
    // -X
    FaceSpec {
        axis: 0,
        sign: -1,
        u_axis: 2,
        v_axis: 1,
        normal: [-1.0, 0.0, 0.0],
    },
    // +Y
    FaceSpec {
        axis: 1,
        sign: 1,
        u_axis: 2,
        v_axis: 0,
        normal: [0.0, 1.0, 0.0],
    },
    // -Y
    FaceSpec {
        axis: 1,
        sign: -1,
        u_axis: 0,
        v_axis: 2,
        normal: [0.0, -1.0, 0.0],
    },
    // +Z
    FaceSpec {
        axis: 2,
        sign: 1,
        u_axis: 0,
        v_axis: 1,
        normal: [0.0, 0.0, 1.0],
    },
    // -Z
    FaceSpec {
        axis: 2,
        sign: -1,
        u_axis: 1,
        v_axis: 0,
        normal: [0.0, 0.0, -1.0],
    },
];

pub fn build_chunk_mesh(
    mode: MeshingMode,
    chunk: &ChunkData,
    registry: &BlockRegistry,
    neighbors: &ChunkNeighbors<'_>,
    chunk_pos: ColumnPos,
) -> ChunkMesh {
    match mode {
        MeshingMode::Naive => build_naive_mesh(chunk, registry, neighbors, chunk_pos),
        MeshingMode::Greedy => build_greedy_mesh(chunk, registry, neighbors, chunk_pos),
    }
}

/// One quad per visible face of every solid block.
pub fn build_naive_mesh(
    chunk: &ChunkData,
    registry: &BlockRegistry,
    neighbors: &ChunkNeighbors<'_>,
    chunk_pos: ColumnPos,
) -> ChunkMesh {
    let mut mesh = ChunkMesh::default();
    let world_offset = world_offset(chunk, chunk_pos);
    let dims = dims(chunk);

    for y in 0..dims[1] {
        for z in 0..dims[2] {
            for x in 0..dims[0] {
                let coords = [x as i32, y as i32, z as i32];
                let block = chunk.get_xyz(coords[0], coords[1], coords[2]).unwrap_or(BlockId::AIR);
                if !registry.is_solid(block) {
                    continue;
                }

                for face in FACE_SPECS {
                    let mut adjacent = coords;
                    adjacent[face.axis] += face.sign;
                    if is_solid_at(chunk, neighbors, registry, adjacent) {
                        continue;
                    }

                    let layer = u32::from(registry.texture_layer(block, face.block_face()));
                    emit_quad(
                        &mut mesh,
                        world_offset,
                        face,
                        coords[face.axis] as usize,
                        coords[face.u_axis] as usize,
                        coords[face.v_axis] as usize,
                        1,
                        1,
                        layer,
                    );
                }
            }
        }
    }

    mesh
}

/// Merges coplanar visible faces that share a texture layer into rectangles.
pub fn build_greedy_mesh(
    chunk: &ChunkData,
    registry: &BlockRegistry,
    neighbors: &ChunkNeighbors<'_>,
    chunk_pos: ColumnPos,
) -> ChunkMesh {
    let mut mesh = ChunkMesh {
        vertices: Vec::with_capacity(4_096),
        indices: Vec::with_capacity(6_144),
    };
    let world_offset = world_offset(chunk, chunk_pos);
    let dims = dims(chunk);
    let shape = chunk.shape();
    let mut visited = bitvec![0; shape.volume()];

    for face in FACE_SPECS {
        // Visited cells only suppress merging within this direction.
        visited.fill(false);

        let u_len = dims[face.u_axis];
        let v_len = dims[face.v_axis];
        let mut mask = vec![None::<u32>; u_len * v_len];

        for slice in 0..dims[face.axis] {
            mask.fill(None);

            for v in 0..v_len {
                for u in 0..u_len {
                    let block_coords = face_block_coords(face, slice, u, v);
                    let block = chunk
                        .get_xyz(block_coords[0], block_coords[1], block_coords[2])
                        .unwrap_or(BlockId::AIR);
                    if !registry.is_solid(block) {
                        continue;
                    }

                    let mut adjacent = block_coords;
                    adjacent[face.axis] += face.sign;
                    if !is_solid_at(chunk, neighbors, registry, adjacent) {
                        mask[v * u_len + u] =
                            Some(u32::from(registry.texture_layer(block, face.block_face())));
                    }
                }
            }

            let cell_index = |u: usize, v: usize| {
                let [x, y, z] = face_block_coords(face, slice, u, v);
                x as usize + shape.size * (z as usize + shape.size * y as usize)
            };

            for v in 0..v_len {
                let mut u = 0usize;
                while u < u_len {
                    let Some(layer) = mask[v * u_len + u] else {
                        u += 1;
                        continue;
                    };
                    if visited[cell_index(u, v)] {
                        u += 1;
                        continue;
                    }

                    let mut width = 1usize;
                    while u + width < u_len
                        && mask[v * u_len + u + width] == Some(layer)
                        && !visited[cell_index(u + width, v)]
                    {
                        width += 1;
                    }

                    let mut height = 1usize;
                    'height: while v + height < v_len {
                        let row = (v + height) * u_len;
                        for du in 0..width {
                            if mask[row + u + du] != Some(layer)
                                || visited[cell_index(u + du, v + height)]
                            {
                                break 'height;
                            }
                        }
                        height += 1;
                    }

                    emit_quad(&mut mesh, world_offset, face, slice, u, v, width, height, layer);

                    for dv in 0..height {
                        for du in 0..width {
                            visited.set(cell_index(u + du, v + dv), true);
                        }
                    }

                    u += width;
                }
            }
        }
    }

    mesh
}

fn dims(chunk: &ChunkData) -> [usize; 3] {
    let shape = chunk.shape();
    [shape.size, shape.height, shape.size]
}

fn world_offset(chunk: &ChunkData, chunk_pos: ColumnPos) -> [f32; 3] {
    let origin = column_origin(chunk_pos, chunk.shape().size);
    [origin.x as f32, origin.y as f32, origin.z as f32]
}

#[allow(clippy::too_many_arguments)]
fn emit_quad(
    mesh: &mut ChunkMesh,
    world_offset: [f32; 3],
    face: FaceSpec,
    slice: usize,
    u: usize,
    v: usize,
    width: usize,
    height: usize,
    layer: u32,
) {
    let plane = if face.sign > 0 { slice + 1 } else { slice };

    let mut p0 = [0.0f32; 3];
    p0[face.axis] = plane as f32;
    p0[face.u_axis] = u as f32;
    p0[face.v_axis] = v as f32;

    let mut p1 = p0;
    p1[face.u_axis] += width as f32;

    let mut p2 = p1;
    p2[face.v_axis] += height as f32;

    let mut p3 = p0;
    p3[face.v_axis] += height as f32;

    let mut positions = [p0, p1, p2, p3];
    for position in &mut positions {
        for axis in 0..3 {
            position[axis] += world_offset[axis];
        }
    }

    // Local UVs: 0..width / 0..height so the shader can fract() to tile
    let w = width as f32;
    let h = height as f32;
    let uvs = [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]];

    push_quad(mesh, positions, face.normal, uvs, layer);
}

fn push_quad(
    mesh: &mut ChunkMesh,
    positions: [[f32; 3]; 4],
    normal: [f32; 3],
    uvs: [[f32; 2]; 4],
    layer: u32,
) {
    let base_index = mesh.vertices.len() as u32;
    for i in 0..4 {
        mesh.vertices.push(ChunkVertex {
            position: positions[i],
            normal,
            uv: uvs[i],
            layer,
        });
    }

    mesh.indices.extend_from_slice(&[
        base_index,
        base_index + 1,
        base_index + 2,
        base_index,
        base_index + 2,
        base_index + 3,
    ]);
}

fn face_block_coords(face: FaceSpec, slice: usize, u: usize, v: usize) -> [i32; 3] {
    let mut coords = [0i32; 3];
    coords[face.axis] = slice as i32;
    coords[face.u_axis] = u as i32;
    coords[face.v_axis] = v as i32;
    coords
}

fn is_solid_at(
    chunk: &ChunkData,
    neighbors: &ChunkNeighbors<'_>,
    registry: &BlockRegistry,
    coords: [i32; 3],
) -> bool {
    sample_block(chunk, neighbors, coords).is_some_and(|block| registry.is_solid(block))
}

/// `None` above or below the column and for absent neighbours.
fn sample_block(chunk: &ChunkData, neighbors: &ChunkNeighbors<'_>, coords: [i32; 3]) -> Option<BlockId> {
    let [x, y, z] = coords;
    let size = chunk.shape().size as i32;

    let neighbor = match (axis_out(x, size), axis_out(z, size)) {
        (0, 0) => return chunk.get_xyz(x, y, z),
        (-1, 0) => neighbors.neg_x,
        (1, 0) => neighbors.pos_x,
        (0, -1) => neighbors.neg_z,
        (0, 1) => neighbors.pos_z,
        _ => None,
    }?;

    neighbor.get_xyz(wrap_to_local(x, size), y, wrap_to_local(z, size))
}

fn axis_out(value: i32, size: i32) -> i8 {
    if value < 0 {
        -1
    } else if value >= size {
        1
    } else {
        0
    }
}

fn wrap_to_local(value: i32, size: i32) -> i32 {
    if value < 0 {
        value + size
    } else if value >= size {
        value - size
    } else {
        value
    }
}
