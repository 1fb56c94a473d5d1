//! Grey-matter label table of the DKT atlas segmentation.
//!
//! White matter, ventricles, brain stem, CSF, ventral DC, choroid plexus
//! and cerebellum are dropped. The kept labels are renumbered 1..=76 in
//! ascending order of their source label.

/// Source label and region name, sorted by source label.
pub const DKT_REGIONS: [(i32, &str); 76] = [
    (10, "L_Thalamus"),
    (11, "L_Caudate"),
    (12, "L_Putamen"),
    (13, "L_Pallidum"),
    (17, "L_Hippocampus"),
    (18, "L_Amygdala"),
    (26, "L_Accumbens"),
    (49, "R_Thalamus"),
    (50, "R_Caudate"),
    (51, "R_Putamen"),
    (52, "R_Pallidum"),
    (53, "R_Hippocampus"),
    (54, "R_Amygdala"),
    (58, "R_Accumbens"),
    (1002, "L_CaudalAnteriorCingulate"),
    (1003, "L_CaudalMiddleFrontal"),
    (1005, "L_Cuneus"),
    (1006, "L_Entorhinal"),
    (1007, "L_Fusiform"),
    (1008, "L_InferiorParietal"),
    (1009, "L_InferiorTemporal"),
    (1010, "L_Isthmuscingulate"),
    (1011, "L_LateralOccipital"),
    (1012, "L_LateralOrbitoFrontal"),
    (1013, "L_Lingual"),
    (1014, "L_MedialOrbitoFrontal"),
    (1015, "L_MiddleTemporal"),
    (1016, "L_ParaHippocampal"),
    (1017, "L_ParaCentral"),
    (1018, "L_ParsOpercularis"),
    (1019, "L_ParsOrbitalis"),
    (1020, "L_ParsTriangularis"),
    (1021, "L_PeriAlcarine"),
    (1022, "L_PostCentral"),
    (1023, "L_PosteriorCingulate"),
    (1024, "L_PreCentral"),
    (1025, "L_Precuneus"),
    (1026, "L_RostralAnteriorCingulate"),
    (1027, "L_RostralMiddleFrontal"),
    (1028, "L_SuperiorFrontal"),
    (1029, "L_SuperiorParietal"),
    (1030, "L_SuperiorTemporal"),
    (1031, "L_SupraMarginal"),
    (1034, "L_TraverseTemporal"),
    (1035, "L_Insula"),
    (2002, "R_CaudalAnteriorCingulate"),
    (2003, "R_CaudalMiddleFrontal"),
    (2005, "R_Cuneus"),
    (2006, "R_Entorhinal"),
    (2007, "R_Fusiform"),
    (2008, "R_InferiorParietal"),
    (2009, "R_InferiorTemporal"),
    (2010, "R_Isthmuscingulate"),
    (2011, "R_LateralOccipital"),
    (2012, "R_LateralOrbitoFrontal"),
    (2013, "R_Lingual"),
    (2014, "R_MedialOrbitoFrontal"),
    (2015, "R_MiddleTemporal"),
    (2016, "R_ParaHippocampal"),
    (2017, "R_ParaCentral"),
    (2018, "R_ParsOpercularis"),
    (2019, "R_ParsOrbitalis"),
    (2020, "R_ParsTriangularis"),
    (2021, "R_PeriAlcarine"),
    (2022, "R_PostCentral"),
    (2023, "R_PosteriorCingulate"),
    (2024, "R_PreCentral"),
    (2025, "R_Precuneus"),
    (2026, "R_RostralAnteriorCingulate"),
    (2027, "R_RostralMiddleFrontal"),
    (2028, "R_SuperiorFrontal"),
    (2029, "R_SuperiorParietal"),
    (2030, "R_SuperiorTemporal"),
    (2031, "R_SupraMarginal"),
    (2034, "R_TraverseTemporal"),
    (2035, "R_Insula"),
];

/// Number of regions after relabeling.
pub const REGION_COUNT: usize = DKT_REGIONS.len();

/// Sequential index (1-based) of a source label, or 0 if it is dropped.
pub fn sequential_index(source_label: i64) -> u16 {
    i32::try_from(source_label)
        .ok()
        .and_then(|label| DKT_REGIONS.binary_search_by_key(&label, |(l, _)| *l).ok())
        .map_or(0, |pos| pos as u16 + 1)
}

/// Region name of a sequential index.
pub fn region_name(index: u16) -> Option<&'static str> {
    let pos = usize::from(index).checked_sub(1)?;
    DKT_REGIONS.get(pos).map(|(_, name)| *name)
}
