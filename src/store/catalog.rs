use std::collections::HashMap;

use serde::{Serialize, Deserialize};

/// Product metadata for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDescriptor {
    /// Manufacturer id
    pub manufacturer: u16,
    /// Product type id
    pub product_type: u16,
    /// Product id
    pub product_id: u16,
    /// Product label
    pub label: String,
    /// Manufacturer name
    pub manufacturer_name: String,
}

/// Looks up product metadata
pub trait ProductCatalog: Send + Sync {
    fn find_product(&self, manufacturer: u16, product_type: u16, product_id: u16) -> Option<ProductDescriptor>;
}

/// Catalog that knows no products
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCatalog;

impl ProductCatalog for NoCatalog {
    fn find_product(&self, _: u16, _: u16, _: u16) -> Option<ProductDescriptor> {
        None
    }
}

/// In-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    products: HashMap<(u16, u16, u16), ProductDescriptor>,
}

impl StaticCatalog {
    pub fn new(products: impl IntoIterator<Item = ProductDescriptor>) -> Self {
        StaticCatalog {
            products: products
                .into_iter()
                .map(|p| ((p.manufacturer, p.product_type, p.product_id), p))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl ProductCatalog for StaticCatalog {
    fn find_product(&self, manufacturer: u16, product_type: u16, product_id: u16) -> Option<ProductDescriptor> {
        self.products.get(&(manufacturer, product_type, product_id)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_catalog() {
        let catalog = StaticCatalog::new(vec![ProductDescriptor {
            manufacturer: 1,
            product_type: 2,
            product_id: 3,
            label: "Plug".to_string(),
            manufacturer_name: "Acme".to_string(),
        }]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.find_product(1, 2, 3).unwrap().label, "Plug");
        assert!(catalog.find_product(1, 2, 4).is_none());
        assert!(NoCatalog.find_product(1, 2, 3).is_none());
    }
}
