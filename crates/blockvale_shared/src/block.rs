use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Pod,
    Zeroable,
)]
pub struct BlockId(pub u16);

impl BlockId {
    pub const AIR: Self = Self(0);
    pub const GRASS: Self = Self(1);
    pub const DIRT: Self = Self(2);
    pub const STONE: Self = Self(3);
    pub const COBBLESTONE: Self = Self(4);
    pub const OAK_LOG: Self = Self(5);
    pub const OAK_PLANKS: Self = Self(6);
    pub const OAK_LEAVES: Self = Self(7);
    pub const SPRUCE_LOG: Self = Self(8);
    pub const SPRUCE_PLANKS: Self = Self(9);
    pub const GLASS: Self = Self(10);
    pub const IRON_ORE: Self = Self(11);
    pub const COAL_ORE: Self = Self(12);
    pub const DIAMOND_ORE: Self = Self(13);
    pub const COPPER_ORE: Self = Self(14);
    pub const SAND: Self = Self(15);
    pub const BEDROCK: Self = Self(16);
    pub const WATER: Self = Self(17);
    pub const SNOW: Self = Self(18);
    pub const SPRUCE_LEAVES: Self = Self(19);
    pub const IRON_BLOCK: Self = Self(20);
    pub const COPPER_BLOCK: Self = Self(21);
    pub const COAL_BLOCK: Self = Self(22);
    pub const DIAMOND_BLOCK: Self = Self(23);
    pub const FURNACE: Self = Self(24);

    pub fn is_air(self) -> bool {
        self == Self::AIR
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockFace {
    Top,
    Bottom,
    Side,
}

/// Texture array layers sampled for each face class of a block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceTextures {
    pub top: u16,
    pub bottom: u16,
    pub side: u16,
}

impl FaceTextures {
    pub const fn uniform(layer: u16) -> Self {
        Self {
            top: layer,
            bottom: layer,
            side: layer,
        }
    }

    pub fn layer(&self, face: BlockFace) -> u16 {
        match face {
            BlockFace::Top => self.top,
            BlockFace::Bottom => self.bottom,
            BlockFace::Side => self.side,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockProperties {
    pub name: String,
    pub solid: bool,
    pub transparent: bool,
    #[serde(default)]
    pub textures: FaceTextures,
}

#[derive(Default, Debug, Clone)]
pub struct BlockRegistry {
    properties: Vec<BlockProperties>,
    by_name: HashMap<String, BlockId>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            properties: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn register(&mut self, props: BlockProperties) -> BlockId {
        if let Some(existing) = self.by_name.get(props.name.as_str()) {
            return *existing;
        }

        let next_index = self.properties.len();
        let id = BlockId(
            u16::try_from(next_index).expect("block registry exceeded BlockId capacity (u16::MAX)"),
        );

        self.by_name.insert(props.name.clone(), id);
        self.properties.push(props);
        id
    }

    pub fn get_properties(&self, id: BlockId) -> Option<&BlockProperties> {
        self.properties.get(usize::from(id.0))
    }

    pub fn get_by_name(&self, name: &str) -> Option<BlockId> {
        self.by_name.get(name).copied()
    }

    /// Unknown ids are treated as non-solid.
    pub fn is_solid(&self, id: BlockId) -> bool {
        self.get_properties(id).is_some_and(|props| props.solid)
    }

    pub fn texture_layer(&self, id: BlockId, face: BlockFace) -> u16 {
        self.get_properties(id)
            .map(|props| props.textures.layer(face))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

pub fn register_default_blocks() -> BlockRegistry {
    fn block(name: &str, solid: bool, transparent: bool, textures: FaceTextures) -> BlockProperties {
        BlockProperties {
            name: name.to_string(),
            solid,
            transparent,
            textures,
        }
    }

    fn capped(top: u16, bottom: u16, side: u16) -> FaceTextures {
        FaceTextures { top, bottom, side }
    }

    let uniform = FaceTextures::uniform;
    let mut registry = BlockRegistry::new();

    let defaults = [
        block("air", false, true, uniform(0)),
        block("grass", true, false, capped(0, 2, 1)),
        block("dirt", true, false, uniform(2)),
        block("stone", true, false, uniform(3)),
        block("cobblestone", true, false, uniform(4)),
        block("oak_log", true, false, capped(5, 5, 6)),
        block("oak_planks", true, false, uniform(7)),
        block("oak_leaves", true, true, uniform(8)),
        block("spruce_log", true, false, capped(9, 9, 10)),
        block("spruce_planks", true, false, uniform(11)),
        block("glass", true, true, uniform(12)),
        block("iron_ore", true, false, uniform(13)),
        block("coal_ore", true, false, uniform(14)),
        block("diamond_ore", true, false, uniform(15)),
        block("copper_ore", true, false, uniform(16)),
        block("sand", true, false, uniform(17)),
        block("bedrock", true, false, uniform(18)),
        block("water", false, true, uniform(19)),
        block("snow", true, false, capped(20, 2, 20)),
        block("spruce_leaves", true, true, uniform(21)),
        block("iron_block", true, false, uniform(22)),
        block("copper_block", true, false, uniform(23)),
        block("coal_block", true, false, uniform(24)),
        block("diamond_block", true, false, uniform(25)),
        block("furnace", true, false, uniform(26)),
    ];

    for props in defaults {
        registry.register(props);
    }

    registry
}
