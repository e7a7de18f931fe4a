//! Server catalog: countries, their cities, and the relay servers in each.
//!
//! The monitor only reads the tree and writes the per-city aggregates
//! (`latency_ms`, `score`). Everything else is owned by whoever loads it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::state::ConnectionScore;

/// Catalog shared between the monitor and its readers
pub type SharedCatalog = Arc<RwLock<Catalog>>;

/// A relay endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub public_key: String,
    /// Probe target
    pub ipv4_addr_in: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub code: String,
    pub name: String,
    /// Country code, filled in from the parent country on load
    #[serde(default)]
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub servers: Vec<Server>,

    /// Mean latency of responding servers, 0 when none responded
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub score: ConnectionScore,
}

impl City {
    pub fn server_keys(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().map(|s| s.public_key.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
    pub cities: Vec<City>,
}

/// Position of a city inside the catalog tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CityKey {
    country: usize,
    city: usize,
}

/// Country → city → server tree with a server index
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    countries: Vec<Country>,
    #[serde(skip)]
    index: HashMap<String, CityKey>,
}

#[derive(Deserialize)]
struct CatalogFile {
    countries: Vec<Country>,
}

impl Catalog {
    pub fn new(countries: Vec<Country>) -> Self {
        let mut catalog = Self {
            countries,
            index: HashMap::new(),
        };
        catalog.reindex();
        catalog
    }

    pub fn shared(self) -> SharedCatalog {
        Arc::new(RwLock::new(self))
    }

    /// Parse a catalog from JSON (`{"countries": [...]}`)
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)?;
        let catalog = Self::new(file.countries);
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Replace the whole tree, keeping the shared handle valid
    pub fn replace(&mut self, countries: Vec<Country>) {
        self.countries = countries;
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (ci, country) in self.countries.iter_mut().enumerate() {
            for (ti, city) in country.cities.iter_mut().enumerate() {
                city.country = country.code.clone();
                for server in &city.servers {
                    self.index.insert(
                        server.public_key.clone(),
                        CityKey {
                            country: ci,
                            city: ti,
                        },
                    );
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let total: usize = self.cities().map(|c| c.servers.len()).sum();
        if total != self.index.len() {
            return Err(Error::Catalog(format!(
                "duplicate server public keys ({} servers, {} unique)",
                total,
                self.index.len()
            )));
        }
        Ok(())
    }

    pub fn countries(&self) -> &[Country] {
        &self.countries
    }

    pub fn cities(&self) -> impl Iterator<Item = &City> {
        self.countries.iter().flat_map(|c| c.cities.iter())
    }

    pub fn cities_mut(&mut self) -> impl Iterator<Item = &mut City> {
        self.countries.iter_mut().flat_map(|c| c.cities.iter_mut())
    }

    pub fn server_count(&self) -> usize {
        self.index.len()
    }

    /// Find a city by country code and city name
    pub fn find_city(&self, country: &str, name: &str) -> Option<&City> {
        self.find_city_key(country, name).map(|key| self.city(key))
    }

    pub fn find_city_key(&self, country: &str, name: &str) -> Option<CityKey> {
        self.find_key_by(country, |city| city.name == name)
    }

    /// Find a city by country code and city code
    pub fn find_city_key_by_code(&self, country: &str, code: &str) -> Option<CityKey> {
        self.find_key_by(country, |city| city.code == code)
    }

    fn find_key_by<F>(&self, country: &str, pred: F) -> Option<CityKey>
    where
        F: Fn(&City) -> bool,
    {
        let ci = self.countries.iter().position(|c| c.code == country)?;
        let ti = self.countries[ci].cities.iter().position(pred)?;
        Some(CityKey {
            country: ci,
            city: ti,
        })
    }

    pub fn city(&self, key: CityKey) -> &City {
        &self.countries[key.country].cities[key.city]
    }

    pub fn city_mut(&mut self, key: CityKey) -> &mut City {
        &mut self.countries[key.country].cities[key.city]
    }

    pub fn city_key_of(&self, public_key: &str) -> Option<CityKey> {
        self.index.get(public_key).copied()
    }

    pub fn server(&self, public_key: &str) -> Option<&Server> {
        let key = self.city_key_of(public_key)?;
        self.city(key)
            .servers
            .iter()
            .find(|s| s.public_key == public_key)
    }
}
