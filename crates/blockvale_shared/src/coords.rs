use std::ops::{Add, AddAssign, Sub, SubAssign};

use glam::IVec3;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: usize = 16;
pub const DEFAULT_WORLD_HEIGHT: usize = 256;

/// Footprint edge length and full height of every chunk column in a world.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnShape {
    pub size: usize,
    pub height: usize,
}

impl Default for ColumnShape {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_WORLD_HEIGHT)
    }
}

impl ColumnShape {
    pub const fn new(size: usize, height: usize) -> Self {
        Self { size, height }
    }

    pub fn volume(&self) -> usize {
        self.size * self.size * self.height
    }

    pub fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        x >= 0
            && z >= 0
            && y >= 0
            && (x as usize) < self.size
            && (z as usize) < self.size
            && (y as usize) < self.height
    }

    pub fn contains_y(&self, y: i32) -> bool {
        y >= 0 && (y as usize) < self.height
    }

    pub fn local_to_index(&self, local: LocalPos) -> usize {
        usize::from(local.x) + self.size * (usize::from(local.z) + self.size * usize::from(local.y))
    }

    pub fn index_to_local(&self, index: usize) -> LocalPos {
        assert!(index < self.volume(), "column index out of bounds: {index}");

        let layer = self.size * self.size;
        let y = index / layer;
        let rem = index % layer;
        let z = rem / self.size;
        let x = rem % self.size;

        LocalPos {
            x: x as u8,
            y: y as u16,
            z: z as u8,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnPos {
    pub x: i32,
    pub z: i32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalPos {
    pub x: u8,
    pub y: u16,
    pub z: u8,
}

impl Add for ColumnPos {
    type Output = ColumnPos;

    fn add(self, rhs: Self) -> Self::Output {
        ColumnPos {
            x: self.x + rhs.x,
            z: self.z + rhs.z,
        }
    }
}

impl AddAssign for ColumnPos {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.z += rhs.z;
    }
}

impl Sub for ColumnPos {
    type Output = ColumnPos;

    fn sub(self, rhs: Self) -> Self::Output {
        ColumnPos {
            x: self.x - rhs.x,
            z: self.z - rhs.z,
        }
    }
}

impl SubAssign for ColumnPos {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.z -= rhs.z;
    }
}

impl ColumnPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    // Order: +X, -X, +Z, -Z
    pub fn face_neighbors(self) -> [ColumnPos; 4] {
        [
            ColumnPos::new(self.x + 1, self.z),
            ColumnPos::new(self.x - 1, self.z),
            ColumnPos::new(self.x, self.z + 1),
            ColumnPos::new(self.x, self.z - 1),
        ]
    }

    pub fn ring_neighbors(self) -> [ColumnPos; 8] {
        let mut ring = [self; 8];
        let mut next = 0;
        for dz in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dz == 0 {
                    continue;
                }
                ring[next] = ColumnPos::new(self.x + dx, self.z + dz);
                next += 1;
            }
        }
        ring
    }

    pub fn distance_sq(self, other: ColumnPos) -> i64 {
        let dx = i64::from(self.x - other.x);
        let dz = i64::from(self.z - other.z);
        dx * dx + dz * dz
    }
}

pub fn div_rem_floor(value: i32, divisor: i32) -> (i32, i32) {
    let mut q = value / divisor;
    let mut r = value % divisor;
    if r < 0 {
        q -= 1;
        r += divisor;
    }
    (q, r)
}

pub fn column_of(world_x: i32, world_z: i32, size: usize) -> ColumnPos {
    let size = size as i32;
    ColumnPos::new(div_rem_floor(world_x, size).0, div_rem_floor(world_z, size).0)
}

/// `None` when `world_pos.y` falls outside the column.
pub fn world_to_local(world_pos: IVec3, shape: ColumnShape) -> Option<(ColumnPos, LocalPos)> {
    if !shape.contains_y(world_pos.y) {
        return None;
    }

    let size = shape.size as i32;
    let (column_x, local_x) = div_rem_floor(world_pos.x, size);
    let (column_z, local_z) = div_rem_floor(world_pos.z, size);

    Some((
        ColumnPos::new(column_x, column_z),
        LocalPos {
            x: local_x as u8,
            y: world_pos.y as u16,
            z: local_z as u8,
        },
    ))
}

pub fn column_to_world(column: ColumnPos, local: LocalPos, size: usize) -> IVec3 {
    let size = size as i32;
    IVec3::new(
        column.x * size + i32::from(local.x),
        i32::from(local.y),
        column.z * size + i32::from(local.z),
    )
}

pub fn column_origin(column: ColumnPos, size: usize) -> IVec3 {
    IVec3::new(column.x * size as i32, 0, column.z * size as i32)
}
