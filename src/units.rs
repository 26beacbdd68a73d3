use std::collections::BTreeSet;

use crate::models::{RATING_FIELDS, RECOMMENDATION_FIELD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    RegistrationLicensing,
    QualityControl,
    Surveillance,
}

impl Section {
    pub const ALL: [Section; 3] = [
        Section::RegistrationLicensing,
        Section::QualityControl,
        Section::Surveillance,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Section::RegistrationLicensing => "Registration & Licensing",
            Section::QualityControl => "Quality Control",
            Section::Surveillance => "Surveillance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit {
    pub id: &'static str,
    pub label: &'static str,
    /// `None` for units tracked by analytics only.
    pub section: Option<Section>,
    pub rating_bearing: bool,
    /// Form field order, excluding the rating block.
    pub field_order: &'static [&'static str],
}

impl Unit {
    /// Configured export column order: form fields, then the rating block for
    /// rating-bearing units.
    pub fn configured_columns(&self) -> Vec<&'static str> {
        let mut columns = self.field_order.to_vec();
        if self.rating_bearing {
            columns.extend(RATING_FIELDS);
            columns.push(RECOMMENDATION_FIELD);
        }
        columns
    }
}

pub const UNITS: [Unit; 15] = [
    Unit {
        id: "animal_feeds",
        label: "Animal Feeds",
        section: Some(Section::RegistrationLicensing),
        rating_bearing: true,
        field_order: &["dateOfMonitoring", "establishmentName", "ownerName", "address", "registrationNumber", "feedType", "remarks"],
    },
    Unit {
        id: "veterinary_drugs",
        label: "Veterinary Drugs and Products",
        section: Some(Section::RegistrationLicensing),
        rating_bearing: true,
        field_order: &["dateOfInspection", "establishmentName", "ownerName", "address", "licenseNumber", "productCategory", "remarks"],
    },
    Unit {
        id: "livestock_handlers",
        label: "Livestock Handlers",
        section: Some(Section::RegistrationLicensing),
        rating_bearing: true,
        field_order: &["dateOfRegistration", "handlerName", "address", "registrationNumber", "species", "headCount"],
    },
    Unit {
        id: "animal_transport",
        label: "Animal Transport Carriers",
        section: Some(Section::RegistrationLicensing),
        rating_bearing: false,
        field_order: &["dateOfApplication", "carrierName", "plateNumber", "address", "vehicleType", "capacity"],
    },
    Unit {
        id: "animal_welfare",
        label: "Animal Welfare Facilities",
        section: Some(Section::RegistrationLicensing),
        rating_bearing: true,
        field_order: &["dateOfInspection", "facilityName", "facilityType", "address", "certificateNumber", "remarks"],
    },
    Unit {
        id: "food_safety",
        label: "Food Safety",
        section: Some(Section::QualityControl),
        rating_bearing: true,
        field_order: &["dateOfMonitoring", "establishmentName", "address", "productSampled", "findings", "actionTaken"],
    },
    Unit {
        id: "meat_establishments",
        label: "Meat Establishments",
        section: Some(Section::QualityControl),
        rating_bearing: true,
        field_order: &["dateOfInspection", "establishmentName", "classification", "address", "accreditationNumber", "remarks"],
    },
    Unit {
        id: "dairy_products",
        label: "Dairy Products",
        section: Some(Section::QualityControl),
        rating_bearing: false,
        field_order: &["dateOfSampling", "producerName", "address", "productType", "volumeLiters", "result"],
    },
    Unit {
        id: "laboratory_services",
        label: "Laboratory Services",
        section: Some(Section::QualityControl),
        rating_bearing: true,
        field_order: &["dateReceived", "clientName", "address", "sampleType", "testRequested", "result"],
    },
    Unit {
        id: "slaughterhouse_inspection",
        label: "Slaughterhouse Inspection",
        section: Some(Section::QualityControl),
        rating_bearing: false,
        field_order: &["dateOfInspection", "slaughterhouseName", "address", "headsSlaughtered", "condemned", "inspector"],
    },
    Unit {
        id: "disease_surveillance",
        label: "Animal Disease Surveillance",
        section: Some(Section::Surveillance),
        rating_bearing: true,
        field_order: &["dateOfSurveillance", "farmName", "ownerName", "address", "species", "disease", "samplesCollected"],
    },
    Unit {
        id: "rabies_control",
        label: "Rabies Control",
        section: Some(Section::Surveillance),
        rating_bearing: false,
        field_order: &["dateOfVaccination", "ownerName", "address", "animalName", "species", "vaccineLot"],
    },
    Unit {
        id: "avian_influenza",
        label: "Avian Influenza Monitoring",
        section: Some(Section::Surveillance),
        rating_bearing: false,
        field_order: &["dateOfCollection", "farmName", "address", "birdType", "samplesCollected", "result"],
    },
    Unit {
        id: "african_swine_fever",
        label: "African Swine Fever Monitoring",
        section: Some(Section::Surveillance),
        rating_bearing: false,
        field_order: &["dateOfCollection", "farmName", "ownerName", "address", "headCount", "result"],
    },
    Unit {
        id: "quarantine_checkpoints",
        label: "Quarantine Checkpoints",
        section: Some(Section::Surveillance),
        rating_bearing: false,
        field_order: &["date", "checkpoint", "origin", "destination", "commodity", "quantity", "permitNumber"],
    },
];

/// Tracked by analytics but not offered as a data-entry form.
pub const CLIENT_SATISFACTION: Unit = Unit {
    id: "client_satisfaction",
    label: "Client Satisfaction Survey",
    section: None,
    rating_bearing: true,
    field_order: &["date", "clientName", "address", "serviceAvailed"],
};

pub fn analytics_units() -> Vec<Unit> {
    UNITS
        .iter()
        .copied()
        .chain(std::iter::once(CLIENT_SATISFACTION))
        .collect()
}

pub fn find(id: &str) -> Option<Unit> {
    analytics_units().into_iter().find(|unit| unit.id == id)
}

/// Registered units in a section, minus the administratively disabled ones.
pub fn visible_units(section: Section, disabled: &BTreeSet<String>) -> Vec<Unit> {
    UNITS
        .iter()
        .filter(|unit| unit.section == Some(section))
        .filter(|unit| !disabled.contains(unit.id))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_fifteen_units_in_three_sections() {
        assert_eq!(UNITS.len(), 15);
        let empty = BTreeSet::new();
        let per_section: usize = Section::ALL
            .iter()
            .map(|section| visible_units(*section, &empty).len())
            .sum();
        assert_eq!(per_section, 15);
        assert_eq!(analytics_units().len(), 16);
    }

    #[test]
    fn unit_ids_are_unique() {
        let ids: BTreeSet<_> = analytics_units().iter().map(|unit| unit.id).collect();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn rating_block_follows_form_fields() {
        let feeds = find("animal_feeds").expect("registered");
        let columns = feeds.configured_columns();
        assert_eq!(columns[0], "dateOfMonitoring");
        assert_eq!(&columns[columns.len() - 6..columns.len() - 1], &RATING_FIELDS[..]);
        assert_eq!(columns.last(), Some(&RECOMMENDATION_FIELD));

        let transport = find("animal_transport").expect("registered");
        assert_eq!(transport.configured_columns(), transport.field_order.to_vec());
    }

    #[test]
    fn disabled_units_are_hidden() {
        let disabled: BTreeSet<String> = ["food_safety".to_string()].into();
        let visible = visible_units(Section::QualityControl, &disabled);
        assert_eq!(visible.len(), 4);
        assert!(visible.iter().all(|unit| unit.id != "food_safety"));
    }

    #[test]
    fn analytics_only_unit_is_not_listed_in_sections() {
        let empty = BTreeSet::new();
        let listed = Section::ALL
            .iter()
            .flat_map(|section| visible_units(*section, &empty))
            .any(|unit| unit.id == CLIENT_SATISFACTION.id);
        assert!(!listed);
        assert_eq!(find("client_satisfaction"), Some(CLIENT_SATISFACTION));
    }
}
