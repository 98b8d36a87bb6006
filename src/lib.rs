//! Tero 代理對話協定的用戶端函式庫。
//!
//! 向代理後端發問、解碼串流回答，並把回答組回對話狀態。
//! 畫面呈現與身分驗證流程不在此處，由呼叫端提供。

pub mod agent;
pub mod logging;
