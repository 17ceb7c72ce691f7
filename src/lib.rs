// データセットの展開
pub mod archive;
// 設定・モデルファイル
pub mod model;
// 学習・推論
pub mod ml;
// 推論 HTTP サーバー
pub mod api;
pub mod cli;

pub use cli::Cli;
