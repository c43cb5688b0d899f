//! Reference solver kernel: simulated annealing over a demo item catalogue.
//!
//! The catalogue is generated deterministically at initialization, one list of
//! items per item type. A set has 16 equipment slots. Optimisation maximises
//! the weighted sum of the set's characteristics.
//!
//! # Optimise request
//!
//! ```json
//! {
//!   "weights": [1.0, 0.5, 2.0, 0.0, 0.0, 0.0, 10.0, 8.0],
//!   "maxLevel": 200,
//!   "bannedItems": [12, 40],
//!   "iterations": 5000,
//!   "initialTemperature": 500.0,
//!   "seed": 7
//! }
//! ```
//!
//! `weights` must hold one entry per characteristic (see [`CHARACTERISTICS`]).
//! Every other field is optional.

use std::collections::BTreeMap;

use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::KernelError;
use crate::scheduler::JobKind;

use super::SolverKernel;

/// Characteristics an item can carry, in weight-vector order.
pub const CHARACTERISTICS: [&str; 8] = [
    "vitality",
    "wisdom",
    "strength",
    "intelligence",
    "chance",
    "agility",
    "ap",
    "mp",
];

const STAT_COUNT: usize = CHARACTERISTICS.len();

/// Number of equipment slots in a set.
pub const SLOT_COUNT: usize = 16;

/// Seed of the demo catalogue.
pub const DEFAULT_CATALOGUE_SEED: u64 = 0x5e7_f0e6e;

const ITEMS_PER_TYPE: usize = 24;
const DEFAULT_MAX_LEVEL: i32 = 200;
const DEFAULT_ITERATIONS: u64 = 2_000;
const DEFAULT_INITIAL_TEMPERATURE: f64 = 500.0;
/// Exponential cooling: `T = T0 * exp(-COOLING_RATE * progress)`.
const COOLING_RATE: f64 = 7.0;

/// Iterations between checks of the stop signal.
const STOP_CHECK_INTERVAL: u64 = 256;

const NAME_PREFIXES: [&str; 12] = [
    "Gobball", "Boon", "Adventurer", "Crackler", "Scaraleaf", "Kwakwa", "Dragoturkey", "Moon",
    "Royal", "Treechnid", "Ancestral", "Silimelle",
];

/// Kind of item; each slot accepts exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemType {
    Hat,
    Cloak,
    Amulet,
    Ring,
    Belt,
    Boots,
    Weapon,
    Shield,
    Dofus,
    Mount,
}

impl ItemType {
    const ALL: [ItemType; 10] = [
        ItemType::Hat,
        ItemType::Cloak,
        ItemType::Amulet,
        ItemType::Ring,
        ItemType::Belt,
        ItemType::Boots,
        ItemType::Weapon,
        ItemType::Shield,
        ItemType::Dofus,
        ItemType::Mount,
    ];

    fn label(self) -> &'static str {
        match self {
            ItemType::Hat => "Hat",
            ItemType::Cloak => "Cloak",
            ItemType::Amulet => "Amulet",
            ItemType::Ring => "Ring",
            ItemType::Belt => "Belt",
            ItemType::Boots => "Boots",
            ItemType::Weapon => "Hammer",
            ItemType::Shield => "Shield",
            ItemType::Dofus => "Dofus",
            ItemType::Mount => "Dragoturkey",
        }
    }
}

/// Returns the item type a slot accepts, or `None` past the last slot.
pub fn slot_item_type(slot: usize) -> Option<ItemType> {
    let item_type = match slot {
        0 => ItemType::Hat,
        1 => ItemType::Cloak,
        2 => ItemType::Amulet,
        3..=4 => ItemType::Ring,
        5 => ItemType::Belt,
        6 => ItemType::Boots,
        7 => ItemType::Weapon,
        8 => ItemType::Shield,
        9..=14 => ItemType::Dofus,
        15 => ItemType::Mount,
        _ => return None,
    };
    Some(item_type)
}

#[derive(Debug, Clone)]
struct Item {
    id: u32,
    name: String,
    item_type: ItemType,
    level: i32,
    stats: [i32; STAT_COUNT],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemView<'a> {
    id: u32,
    name: &'a str,
    item_type: ItemType,
    level: i32,
    characteristics: BTreeMap<&'static str, i32>,
}

impl Item {
    fn view(&self) -> ItemView<'_> {
        ItemView {
            id: self.id,
            name: &self.name,
            item_type: self.item_type,
            level: self.level,
            characteristics: characteristic_map(&self.stats, false),
        }
    }
}

fn characteristic_map(stats: &[i32; STAT_COUNT], keep_zero: bool) -> BTreeMap<&'static str, i32> {
    CHARACTERISTICS
        .iter()
        .zip(stats)
        .filter(|(_, value)| keep_zero || **value != 0)
        .map(|(name, value)| (*name, *value))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Spell {
    name: &'static str,
    base_damage: [f64; 5],
    base_crit_damage: [f64; 5],
    base_crit_percent: i32,
    crit_modifyable: bool,
}

const SPELLS: [Spell; 4] = [
    Spell {
        name: "Pressure",
        base_damage: [0.0, 19.0, 0.0, 0.0, 0.0],
        base_crit_damage: [0.0, 23.0, 0.0, 0.0, 0.0],
        base_crit_percent: 10,
        crit_modifyable: true,
    },
    Spell {
        name: "Fulminating Arrow",
        base_damage: [0.0, 0.0, 28.0, 0.0, 0.0],
        base_crit_damage: [0.0, 0.0, 33.0, 0.0, 0.0],
        base_crit_percent: 5,
        crit_modifyable: true,
    },
    Spell {
        name: "Moon Hammer",
        base_damage: [0.0, 0.0, 0.0, 24.0, 0.0],
        base_crit_damage: [0.0, 0.0, 0.0, 29.0, 0.0],
        base_crit_percent: 15,
        crit_modifyable: true,
    },
    Spell {
        name: "Poisoned Wind",
        base_damage: [0.0, 0.0, 0.0, 0.0, 21.0],
        base_crit_damage: [0.0, 0.0, 0.0, 0.0, 21.0],
        base_crit_percent: 0,
        crit_modifyable: false,
    },
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptimiseRequest {
    weights: Vec<f64>,
    #[serde(default = "default_max_level")]
    max_level: i32,
    #[serde(default)]
    banned_items: Vec<u32>,
    #[serde(default = "default_iterations")]
    iterations: u64,
    #[serde(default = "default_initial_temperature")]
    initial_temperature: f64,
    #[serde(default)]
    seed: Option<u64>,
}

fn default_max_level() -> i32 {
    DEFAULT_MAX_LEVEL
}

fn default_iterations() -> u64 {
    DEFAULT_ITERATIONS
}

fn default_initial_temperature() -> f64 {
    DEFAULT_INITIAL_TEMPERATURE
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OptimiseResponse<'a> {
    energy: f64,
    items: Vec<Option<ItemView<'a>>>,
    overall_characteristics: BTreeMap<&'static str, i32>,
}

/// Demo catalogue: items grouped by type.
#[derive(Debug)]
struct Catalogue {
    items: Vec<Item>,
    by_type: BTreeMap<u8, Vec<usize>>,
}

impl Catalogue {
    fn generate(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut items = Vec::with_capacity(ItemType::ALL.len() * ITEMS_PER_TYPE);
        let mut by_type = BTreeMap::new();

        for item_type in ItemType::ALL {
            let mut indices = Vec::with_capacity(ITEMS_PER_TYPE);
            for _ in 0..ITEMS_PER_TYPE {
                let level = rng.random_range(1..=200);
                let mut stats = [0; STAT_COUNT];
                // Primary characteristics scale with level; AP/MP are rare.
                for stat in stats.iter_mut().take(6) {
                    if rng.random::<f64>() < 0.4 {
                        *stat = rng.random_range(1..=(level / 2 + 10));
                    }
                }
                if rng.random::<f64>() < 0.08 {
                    stats[6] = 1;
                }
                if rng.random::<f64>() < 0.08 {
                    stats[7] = 1;
                }

                let id = items.len() as u32;
                let prefix = NAME_PREFIXES[rng.random_range(0..NAME_PREFIXES.len())];
                indices.push(items.len());
                items.push(Item {
                    id,
                    name: format!("{} {}", prefix, item_type.label()),
                    item_type,
                    level,
                    stats,
                });
            }
            by_type.insert(item_type as u8, indices);
        }

        Self { items, by_type }
    }

    fn of_type(&self, item_type: ItemType) -> &[usize] {
        self.by_type
            .get(&(item_type as u8))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Simulated-annealing kernel over the demo catalogue.
#[derive(Debug)]
pub struct AnnealingKernel {
    catalogue_seed: u64,
    catalogue: Option<Catalogue>,
}

impl Default for AnnealingKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnealingKernel {
    pub fn new() -> Self {
        Self::with_catalogue_seed(DEFAULT_CATALOGUE_SEED)
    }

    /// Creates a kernel whose catalogue is generated from `seed`.
    pub fn with_catalogue_seed(seed: u64) -> Self {
        Self {
            catalogue_seed: seed,
            catalogue: None,
        }
    }

    fn catalogue(&self) -> Result<&Catalogue, KernelError> {
        self.catalogue
            .as_ref()
            .ok_or_else(|| KernelError::Fatal("kernel used before initialization".to_string()))
    }

    fn items_in_slot(&self, payload: &Value) -> Result<Value, KernelError> {
        let catalogue = self.catalogue()?;
        let slot = payload
            .get("slot")
            .and_then(Value::as_u64)
            .ok_or_else(|| KernelError::Rejected("slot must be a non-negative integer".to_string()))?;
        let item_type = usize::try_from(slot)
            .ok()
            .and_then(slot_item_type)
            .ok_or_else(|| KernelError::Rejected("Requested slot is out of range".to_string()))?;

        let views: Vec<_> = catalogue
            .of_type(item_type)
            .iter()
            .map(|&index| catalogue.items[index].view())
            .collect();
        to_value(&views)
    }

    fn all_items(&self) -> Result<Value, KernelError> {
        let catalogue = self.catalogue()?;
        let views: Vec<_> = catalogue.items.iter().map(Item::view).collect();
        to_value(&views)
    }

    fn optimise(&self, payload: Value, stop: &CancellationToken) -> Result<Value, KernelError> {
        let catalogue = self.catalogue()?;
        let request: OptimiseRequest = serde_json::from_value(payload)
            .map_err(|e| KernelError::Rejected(format!("invalid optimise request: {}", e)))?;

        if request.weights.len() != STAT_COUNT {
            return Err(KernelError::Rejected(format!(
                "expected {} weights, got {}",
                STAT_COUNT,
                request.weights.len()
            )));
        }
        if !(request.initial_temperature.is_finite() && request.initial_temperature > 0.0) {
            return Err(KernelError::Rejected(
                "initialTemperature must be a positive number".to_string(),
            ));
        }

        let mut rng = match request.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };

        let candidates: Vec<Vec<usize>> = (0..SLOT_COUNT)
            .map(|slot| {
                slot_item_type(slot)
                    .map(|item_type| {
                        catalogue
                            .of_type(item_type)
                            .iter()
                            .copied()
                            .filter(|&index| {
                                let item = &catalogue.items[index];
                                item.level <= request.max_level
                                    && !request.banned_items.contains(&item.id)
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();
        let open_slots: Vec<usize> = (0..SLOT_COUNT)
            .filter(|&slot| !candidates[slot].is_empty())
            .collect();

        let weights = &request.weights;
        let mut current = [None; SLOT_COUNT];
        let mut current_energy = energy(&totals(&current, catalogue), weights);
        let mut best = current;
        let mut best_energy = current_energy;

        if !open_slots.is_empty() {
            for iteration in 0..request.iterations {
                if iteration % STOP_CHECK_INTERVAL == 0 && stop.is_cancelled() {
                    debug!(iteration, "Annealing interrupted");
                    return Err(KernelError::Interrupted);
                }

                let progress = (iteration + 1) as f64 / request.iterations as f64;
                let temperature = request.initial_temperature * (-COOLING_RATE * progress).exp();

                let slot = open_slots[rng.random_range(0..open_slots.len())];
                let options = &candidates[slot];
                let pick = options[rng.random_range(0..options.len())];

                let mut neighbour = current;
                // An item can only be worn once; moving it vacates its old slot.
                for equipped in neighbour.iter_mut() {
                    if *equipped == Some(pick) {
                        *equipped = None;
                    }
                }
                neighbour[slot] = Some(pick);

                let neighbour_energy = energy(&totals(&neighbour, catalogue), weights);
                if accept_probability(current_energy, neighbour_energy, temperature)
                    >= rng.random::<f64>()
                {
                    current = neighbour;
                    current_energy = neighbour_energy;
                    if current_energy > best_energy {
                        best = current;
                        best_energy = current_energy;
                    }
                }
            }
        }

        debug!(
            energy = best_energy,
            iterations = request.iterations,
            "Annealing finished"
        );

        let response = OptimiseResponse {
            energy: best_energy,
            items: best
                .iter()
                .map(|slot| slot.map(|index| catalogue.items[index].view()))
                .collect(),
            overall_characteristics: characteristic_map(&totals(&best, catalogue), true),
        };
        to_value(&response)
    }
}

impl SolverKernel for AnnealingKernel {
    fn initialize(&mut self) -> Result<(), KernelError> {
        let catalogue = Catalogue::generate(self.catalogue_seed);
        debug!(items = catalogue.items.len(), "Generated item catalogue");
        self.catalogue = Some(catalogue);
        Ok(())
    }

    fn run(
        &mut self,
        kind: JobKind,
        payload: Value,
        stop: &CancellationToken,
    ) -> Result<Value, KernelError> {
        match kind {
            JobKind::Optimise => self.optimise(payload, stop),
            JobKind::LookupSlot => self.items_in_slot(&payload),
            JobKind::LookupCatalog => self.all_items(),
            JobKind::LookupSpells => to_value(&SPELLS),
        }
    }
}

/// Probability of moving from `current` to `neighbour` when maximising.
fn accept_probability(current: f64, neighbour: f64, temperature: f64) -> f64 {
    if neighbour > current {
        1.0
    } else {
        (-(current - neighbour) / temperature).exp()
    }
}

fn totals(set: &[Option<usize>; SLOT_COUNT], catalogue: &Catalogue) -> [i32; STAT_COUNT] {
    let mut totals = [0; STAT_COUNT];
    for index in set.iter().flatten() {
        for (total, value) in totals.iter_mut().zip(catalogue.items[*index].stats) {
            *total += value;
        }
    }
    totals
}

fn energy(totals: &[i32; STAT_COUNT], weights: &[f64]) -> f64 {
    totals
        .iter()
        .zip(weights)
        .map(|(total, weight)| f64::from(*total) * weight)
        .sum()
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, KernelError> {
    serde_json::to_value(value).map_err(|e| KernelError::Fatal(format!("failed to encode response: {}", e)))
}
