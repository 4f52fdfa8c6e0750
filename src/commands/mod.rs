pub mod lastmessage;

pub fn all() -> Vec<poise::Command<crate::Data, crate::Error>> {
    vec![lastmessage::lastmessage()]
}
