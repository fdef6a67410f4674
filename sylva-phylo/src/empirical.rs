//! Fixed empirical amino-acid replacement matrices (JTT, WAG, LG).
//!
//! Exchangeabilities are stored in the PAML lower-triangle layout: entry
//! `(i, j)` with `j < i` appears in row `i`, rows ordered by the amino-acid
//! order `A R N D C Q E G H I L K M F P S T W Y V`.

use crate::linalg::Matrix;

/// Number of amino acid states.
pub const AA_STATES: usize = 20;

/// One-letter codes in state order.
pub const AMINO_ACIDS: [u8; AA_STATES] = *b"ARNDCQEGHILKMFPSTWYV";

/// A published 20-state replacement matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EmpiricalMatrix {
    /// Jones, Taylor & Thornton 1992.
    Jtt,
    /// Whelan & Goldman 2001.
    Wag,
    /// Le & Gascuel 2008.
    Lg,
}

impl EmpiricalMatrix {
    /// Short name as used in model strings.
    pub fn name(self) -> &'static str {
        match self {
            Self::Jtt => "JTT",
            Self::Wag => "WAG",
            Self::Lg => "LG",
        }
    }

    /// Symmetric exchangeability matrix with a zero diagonal.
    pub fn exchangeabilities(self) -> Matrix {
        let table = match self {
            Self::Jtt => &JTT_EXCHANGEABILITIES,
            Self::Wag => &WAG_EXCHANGEABILITIES,
            Self::Lg => &LG_EXCHANGEABILITIES,
        };
        lower_triangle_to_matrix(table)
    }

    /// Equilibrium frequencies, renormalized to sum to exactly one.
    pub fn frequencies(self) -> Vec<f64> {
        let table = match self {
            Self::Jtt => &JTT_FREQUENCIES,
            Self::Wag => &WAG_FREQUENCIES,
            Self::Lg => &LG_FREQUENCIES,
        };
        let total: f64 = table.iter().sum();
        table.iter().map(|&f| f / total).collect()
    }
}

fn lower_triangle_to_matrix(values: &[f64; 190]) -> Matrix {
    let mut s = Matrix::zeros(AA_STATES);
    let mut idx = 0;
    for i in 1..AA_STATES {
        for j in 0..i {
            s[(i, j)] = values[idx];
            s[(j, i)] = values[idx];
            idx += 1;
        }
    }
    s
}

/// JTT exchangeabilities, Jones, Taylor & Thornton (1992), lower triangle by row.
static JTT_EXCHANGEABILITIES: [f64; 190] = [
    // R
    0.531678,
    // N
    0.557967, 0.451095,
    // D
    0.827445, 0.154899, 5.549530,
    // C
    0.574478, 1.019843, 0.313311, 0.105625,
    // Q
    0.556725, 3.021995, 0.768834, 0.521646, 0.091304,
    // E
    1.066681, 0.318483, 0.578115, 7.766557, 0.053907, 3.417706,
    // G
    1.740159, 1.359652, 0.773313, 1.272434, 0.546389, 0.231294, 1.115632,
    // H
    0.219970, 3.210671, 4.025778, 1.032342, 0.724998, 5.684080, 0.243768, 0.201696,
    // I
    0.361684, 0.239195, 0.491003, 0.115968, 0.150559, 0.078270, 0.111773, 0.053769,
    0.181788,
    // L
    0.310007, 0.372261, 0.137289, 0.061486, 0.164593, 0.709004, 0.097485, 0.069492,
    0.540571, 2.335139,
    // K
    0.369437, 6.529255, 2.529517, 0.282466, 0.049009, 2.966732, 1.731684, 0.269840,
    0.525096, 0.202562, 0.146481,
    // M
    0.469395, 0.431045, 0.330720, 0.190001, 0.409202, 0.456901, 0.175084, 0.130379,
    0.329660, 4.831666, 3.856906, 0.624581,
    // F
    0.138293, 0.065314, 0.073481, 0.032522, 0.678335, 0.045683, 0.043829, 0.050212,
    0.453428, 0.777090, 2.500294, 0.024521, 0.436181,
    // P
    1.959599, 0.710489, 0.121804, 0.127164, 0.123653, 1.608126, 0.191994, 0.208081,
    1.141961, 0.098580, 1.060504, 0.216345, 0.164215, 0.148483,
    // S
    3.887095, 1.001551, 5.057964, 0.589268, 2.155331, 0.548807, 0.312449, 1.874296,
    0.743458, 0.405119, 0.592511, 0.474478, 0.285564, 0.943971, 2.788406,
    // T
    4.582565, 0.650282, 2.351311, 0.425159, 0.469823, 0.523825, 0.331584, 0.316862,
    0.477355, 2.553806, 0.272514, 0.965641, 2.114728, 0.138904, 1.176961, 4.777647,
    // W
    0.084329, 1.257961, 0.027700, 0.057466, 1.104181, 0.172206, 0.114381, 0.544180,
    0.128193, 0.134510, 0.530324, 0.089134, 0.201334, 0.537922, 0.069965, 0.310927,
    0.080556,
    // Y
    0.139492, 0.235601, 0.700693, 0.453952, 2.114852, 0.254745, 0.063452, 0.052500,
    5.848400, 0.303445, 0.241094, 0.087904, 0.189870, 5.484236, 0.113850, 0.628608,
    0.201094, 0.747889,
    // V
    2.924161, 0.171995, 0.164525, 0.315261, 0.621323, 0.179771, 0.465271, 0.470140,
    0.121827, 9.533943, 1.761439, 0.124066, 3.038533, 0.593478, 0.211561, 0.408532,
    1.143980, 0.239697, 0.165473,
];

/// JTT equilibrium frequencies in state order.
static JTT_FREQUENCIES: [f64; 20] = [
    0.076748, 0.051691, 0.042645, 0.051544, 0.019803, 0.040752, 0.061830, 0.073152,
    0.022944, 0.053761, 0.091904, 0.058676, 0.023826, 0.040126, 0.050901, 0.068765,
    0.058565, 0.014261, 0.032102, 0.066005,
];

/// WAG exchangeabilities, Whelan & Goldman (2001), lower triangle by row.
static WAG_EXCHANGEABILITIES: [f64; 190] = [
    // R
    0.551571,
    // N
    0.509848, 0.635346,
    // D
    0.738998, 0.147304, 5.429420,
    // C
    1.027040, 0.528191, 0.265256, 0.0302949,
    // Q
    0.908598, 3.035500, 1.543640, 0.616783, 0.0988179,
    // E
    1.582850, 0.439157, 0.947198, 6.174160, 0.021352, 5.469470,
    // G
    1.416720, 0.584665, 1.125560, 0.865584, 0.306674, 0.330052, 0.567717,
    // H
    0.316954, 2.137150, 3.956290, 0.930676, 0.248972, 4.294110, 0.570025, 0.249410,
    // I
    0.193335, 0.186979, 0.554236, 0.039437, 0.170135, 0.113917, 0.127395, 0.0304501,
    0.138190,
    // L
    0.397915, 0.497671, 0.131528, 0.0848047, 0.384287, 0.869489, 0.154263, 0.0613037,
    0.499462, 3.170970,
    // K
    0.906265, 5.351420, 3.012010, 0.479855, 0.0740339, 3.894900, 2.584430, 0.373558,
    0.890432, 0.323832, 0.257555,
    // M
    0.893496, 0.683162, 0.198221, 0.103754, 0.390482, 1.545260, 0.315124, 0.174100,
    0.404141, 4.257460, 4.854020, 0.934276,
    // F
    0.210494, 0.102711, 0.0961621, 0.0467304, 0.398020, 0.0999208, 0.0811339, 0.049931,
    0.679371, 1.059470, 2.115170, 0.088836, 1.190630,
    // P
    1.438550, 0.679489, 0.195081, 0.423984, 0.109404, 0.933372, 0.682355, 0.243570,
    0.696198, 0.0999288, 0.415844, 0.556896, 0.171329, 0.161444,
    // S
    3.370790, 1.224190, 3.974230, 1.071760, 1.407660, 1.028870, 0.704939, 1.341820,
    0.740169, 0.319440, 0.344739, 0.967130, 0.493905, 0.545931, 1.613280,
    // T
    2.121110, 0.554413, 2.030060, 0.374866, 0.512984, 0.857928, 0.822765, 0.225833,
    0.473307, 1.458160, 0.326622, 1.386980, 1.516120, 0.171903, 0.795384, 4.378020,
    // W
    0.113133, 1.163920, 0.0719167, 0.129767, 0.717070, 0.215737, 0.156557, 0.336983,
    0.262569, 0.212483, 0.665309, 0.137505, 0.515706, 1.529640, 0.139405, 0.523742,
    0.110864,
    // Y
    0.240735, 0.381533, 1.086000, 0.325711, 0.543833, 0.227710, 0.196303, 0.103604,
    3.873440, 0.420170, 0.398618, 0.133264, 0.428437, 6.454280, 0.216046, 0.786993,
    0.291148, 2.485390,
    // V
    2.006010, 0.251849, 0.196246, 0.152335, 1.002140, 0.301281, 0.588731, 0.187247,
    0.118358, 7.821300, 1.800340, 0.305434, 2.058450, 0.649892, 0.314887, 0.232739,
    1.388230, 0.365369, 0.314730,
];

/// WAG equilibrium frequencies in state order.
static WAG_FREQUENCIES: [f64; 20] = [
    0.0866279, 0.043972, 0.0390894, 0.0570451, 0.0193078, 0.0367281, 0.0580589, 0.0832518,
    0.0244313, 0.048466, 0.086209, 0.0620286, 0.0195027, 0.0384319, 0.0457631, 0.0695179,
    0.0610127, 0.0143859, 0.0352742, 0.0708956,
];

/// LG exchangeabilities, Le & Gascuel (2008), lower triangle by row.
static LG_EXCHANGEABILITIES: [f64; 190] = [
    // R
    0.425093,
    // N
    0.276818, 0.751878,
    // D
    0.395144, 0.123954, 5.076149,
    // C
    2.489084, 0.534551, 0.528768, 0.062556,
    // Q
    0.969894, 2.807908, 1.695752, 0.523386, 0.084808,
    // E
    1.038545, 0.363970, 0.541712, 5.243870, 0.003499, 4.128591,
    // G
    2.066040, 0.390192, 1.437645, 0.844926, 0.569265, 0.267959, 0.348847,
    // H
    0.358858, 2.426601, 4.509238, 0.927114, 0.640543, 4.813505, 0.423881, 0.311484,
    // I
    0.149830, 0.126991, 0.191503, 0.010690, 0.320627, 0.072854, 0.044265, 0.008705,
    0.108882,
    // L
    0.395337, 0.301848, 0.068427, 0.015076, 0.594007, 0.582457, 0.069673, 0.044261,
    0.366317, 4.145067,
    // K
    0.536518, 6.326067, 2.145078, 0.282959, 0.013266, 3.234294, 1.807177, 0.296636,
    0.697264, 0.159069, 0.137500,
    // M
    1.124035, 0.484133, 0.371004, 0.025548, 0.893680, 1.672569, 0.173735, 0.139538,
    0.442472, 4.273607, 6.312358, 0.656604,
    // F
    0.253701, 0.052722, 0.089525, 0.017416, 1.105251, 0.035855, 0.018811, 0.089586,
    0.682139, 1.112727, 2.592692, 0.023918, 1.798853,
    // P
    1.177651, 0.332533, 0.161787, 0.394456, 0.075382, 0.624294, 0.419409, 0.196961,
    0.508851, 0.078281, 0.249060, 0.390322, 0.099849, 0.094464,
    // S
    4.727182, 0.858151, 4.008358, 1.240275, 2.784478, 1.223828, 0.611973, 1.739990,
    0.990012, 0.064105, 0.182287, 0.748683, 0.346960, 0.361819, 1.338132,
    // T
    2.139501, 0.578987, 2.000679, 0.425860, 1.143480, 1.080136, 0.604545, 0.129836,
    0.584262, 1.033739, 0.302936, 1.136863, 2.020366, 0.165001, 0.571468, 6.472279,
    // W
    0.180717, 0.593607, 0.045376, 0.029890, 0.670128, 0.236199, 0.077852, 0.268491,
    0.597054, 0.111660, 0.619632, 0.049906, 0.696175, 2.457121, 0.095131, 0.248862,
    0.140825,
    // Y
    0.218959, 0.314440, 0.612025, 0.135107, 1.165532, 0.257336, 0.120037, 0.054679,
    5.306834, 0.232523, 0.299648, 0.131932, 0.481306, 7.803902, 0.089613, 0.400547,
    0.245841, 3.151815,
    // V
    2.547870, 0.170887, 0.083688, 0.037967, 1.959291, 0.210332, 0.245034, 0.076701,
    0.119013, 10.649107, 1.702745, 0.185202, 1.898718, 0.654683, 0.296501, 0.098369,
    2.188158, 0.189510, 0.249313,
];

/// LG equilibrium frequencies in state order.
static LG_FREQUENCIES: [f64; 20] = [
    0.079066, 0.055941, 0.041977, 0.053052, 0.012937, 0.040767, 0.071586, 0.057337,
    0.022355, 0.062157, 0.099081, 0.064600, 0.022951, 0.042302, 0.044040, 0.061197,
    0.053287, 0.012066, 0.034155, 0.069147,
];
