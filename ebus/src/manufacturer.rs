use num_derive::FromPrimitive;
use num_traits::cast::FromPrimitive as _;

/// Known manufacturer codes of the identification message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Manufacturer {
    Dungs = 0x06,
    FhOstfalia = 0x0f,
    Tem = 0x10,
    Lamberti = 0x11,
    Ceb = 0x14,
    LandisStaefa = 0x15,
    Ferro = 0x16,
    Mondial = 0x17,
    Wikon = 0x18,
    Wolf = 0x19,
    Rawe = 0x20,
    Satronic = 0x30,
    Encon = 0x40,
    Kromschroeder = 0x50,
    Eberle = 0x60,
    Ebv = 0x65,
    Graesslin = 0x75,
    EbmPapst = 0x85,
    Sig = 0x95,
    Theben = 0xa5,
    Thermowatt = 0xa7,
    Vaillant = 0xb5,
    Toby = 0xc0,
    Weishaupt = 0xc5,
    Ebusd = 0xfd,
}

impl Manufacturer {
    pub fn name(self) -> &'static str {
        match self {
            Self::Dungs => "Dungs",
            Self::FhOstfalia => "FH Ostfalia",
            Self::Tem => "TEM",
            Self::Lamberti => "Lamberti",
            Self::Ceb => "CEB",
            Self::LandisStaefa => "Landis-Staefa",
            Self::Ferro => "FERRO",
            Self::Mondial => "MONDIAL",
            Self::Wikon => "Wikon",
            Self::Wolf => "Wolf",
            Self::Rawe => "RAWE",
            Self::Satronic => "Satronic",
            Self::Encon => "ENCON",
            Self::Kromschroeder => "Kromschroeder",
            Self::Eberle => "Eberle",
            Self::Ebv => "EBV",
            Self::Graesslin => "Graesslin",
            Self::EbmPapst => "ebm-papst",
            Self::Sig => "SIG",
            Self::Theben => "Theben",
            Self::Thermowatt => "Thermowatt",
            Self::Vaillant => "Vaillant",
            Self::Toby => "Toby",
            Self::Weishaupt => "Weishaupt",
            Self::Ebusd => "ebusd.eu",
        }
    }
}

/// The manufacturer name for the code, or the hex code for unknown ones.
pub fn manufacturer_name(code: u8) -> String {
    match Manufacturer::from_u8(code) {
        Some(m) => m.name().to_string(),
        None => format!("{:02x}", code),
    }
}

/// Value list for the manufacturer field of the identification message.
pub fn manufacturer_values() -> Vec<(u32, String)> {
    (0..=0xffu32)
        .filter_map(|code| {
            Manufacturer::from_u32(code).map(|m| (code, m.name().to_string()))
        })
        .collect()
}
